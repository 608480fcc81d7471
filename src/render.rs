//! Console rendering of generation results
//!
//! Binary artifacts go through an [`ArtifactSink`]; everything else is
//! printed. A sink failure is reported for that artifact only.

use crate::proto::{self, artifact::Data};
use std::io::{self, Write};
use std::path::PathBuf;

/// Failure to persist one artifact's binary payload
#[derive(Debug, thiserror::Error)]
#[error("failed to write artifact {artifact_id} to temp file: {source}")]
pub struct ArtifactWriteError {
    pub artifact_id: u64,
    #[source]
    pub source: io::Error,
}

/// Destination for binary artifact payloads
pub trait ArtifactSink {
    /// Store `data` and return where it went
    fn persist(&mut self, artifact: &proto::Artifact, data: &[u8]) -> io::Result<PathBuf>;
}

/// Writes each payload to a new, uniquely named file (`stabilityai.*.png`)
/// that is kept after the process exits.
#[derive(Debug, Clone, Default)]
pub struct TempFileSink {
    dir: Option<PathBuf>,
}

impl TempFileSink {
    /// Sink writing to the system temp directory
    pub fn new() -> Self {
        Self { dir: None }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }
}

impl ArtifactSink for TempFileSink {
    fn persist(&mut self, artifact: &proto::Artifact, data: &[u8]) -> io::Result<PathBuf> {
        let suffix = format!(".{}", extension_for(&artifact.mime));
        let mut builder = tempfile::Builder::new();
        builder.prefix("stabilityai.").suffix(&suffix);

        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(data)?;
        file.flush()?;

        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Outcome of rendering a batch of answers
#[derive(Debug, Default)]
pub struct RenderSummary {
    pub artifacts: usize,
    pub files: Vec<PathBuf>,
    pub write_errors: Vec<ArtifactWriteError>,
}

/// Print every answer and artifact to `out`, persisting binary payloads
/// through `sink`.
///
/// Only errors writing to `out` abort rendering.
pub fn render_answers<W, S>(
    answers: &[proto::Answer],
    out: &mut W,
    sink: &mut S,
) -> io::Result<RenderSummary>
where
    W: Write,
    S: ArtifactSink + ?Sized,
{
    let mut summary = RenderSummary::default();

    for (idx, answer) in answers.iter().enumerate() {
        writeln!(out, "{}) received {} artifacts", idx + 1, answer.artifacts.len())?;

        for artifact in &answer.artifacts {
            summary.artifacts += 1;
            match render_artifact(artifact, out, sink)? {
                Ok(Some(path)) => summary.files.push(path),
                Ok(None) => {}
                Err(e) => summary.write_errors.push(e),
            }
        }
    }

    Ok(summary)
}

fn render_artifact<W, S>(
    artifact: &proto::Artifact,
    out: &mut W,
    sink: &mut S,
) -> io::Result<Result<Option<PathBuf>, ArtifactWriteError>>
where
    W: Write,
    S: ArtifactSink + ?Sized,
{
    writeln!(out, "ID       : {}", artifact.id)?;
    writeln!(out, "Type     : {}", artifact.r#type().as_str_name())?;
    writeln!(out, "MIME     : {}", artifact.mime)?;
    if let Some(magic) = &artifact.magic {
        writeln!(out, "Magic    : {}", magic)?;
    }

    let mut written = Ok(None);

    match &artifact.data {
        Some(Data::Text(text)) => writeln!(out, "Text     : {}", text)?,
        Some(Data::Tokens(tokens)) => writeln!(out, "Tokens   : {}", format_tokens(tokens))?,
        Some(Data::Binary(data)) => {
            written = persist_binary(artifact, data, out, sink)?;
        }
        Some(Data::Classifier(classifier)) => render_classifier(classifier, out)?,
        None => {}
    }

    writeln!(out)?;
    Ok(written)
}

fn persist_binary<W, S>(
    artifact: &proto::Artifact,
    data: &[u8],
    out: &mut W,
    sink: &mut S,
) -> io::Result<Result<Option<PathBuf>, ArtifactWriteError>>
where
    W: Write,
    S: ArtifactSink + ?Sized,
{
    match sink.persist(artifact, data) {
        Ok(path) => {
            writeln!(out, "Written to file {}", path.display())?;
            Ok(Ok(Some(path)))
        }
        Err(source) => {
            let err = ArtifactWriteError {
                artifact_id: artifact.id,
                source,
            };
            tracing::error!("{}", err);
            writeln!(out, "Failed to write to temp file: {}", err.source)?;
            Ok(Err(err))
        }
    }
}

fn render_classifier<W: Write>(classifier: &proto::ClassifierParameters, out: &mut W) -> io::Result<()> {
    for category in &classifier.categories {
        let action = match category.action {
            Some(_) => category.action().as_str_name(),
            None => "unset",
        };

        writeln!(out, "Category : {}", category.name)?;
        writeln!(out, "Action   : {}", action)?;
        for concept in &category.concepts {
            match concept.threshold {
                Some(threshold) => writeln!(
                    out,
                    "Concept  : {}, threshold: {:.6}",
                    concept.concept, threshold
                )?,
                None => writeln!(out, "Concept  : {}, threshold: unset", concept.concept)?,
            }
        }
    }
    Ok(())
}

fn format_tokens(tokens: &proto::Tokens) -> String {
    tokens
        .tokens
        .iter()
        .map(|token| match &token.text {
            Some(text) => text.clone(),
            None => format!("#{}", token.id),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
