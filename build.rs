fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use a vendored protoc when none is provided by the environment
    if std::env::var_os("PROTOC").is_none() {
        // SAFETY: build scripts are single-threaded at this point
        unsafe { std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?) };
    }

    // Server stubs are only used by the in-process test server
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/generation.proto"], &["proto/"])?;

    println!("cargo:rerun-if-changed=proto/generation.proto");

    Ok(())
}
