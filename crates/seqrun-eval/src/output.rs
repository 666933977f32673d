//! Output streams, line sinks and the scored translation line format.

use std::fs::File;
use std::io::{BufWriter, Stdout, Write};
use std::path::{Path, PathBuf};

use seqrun_core::{AlignmentType, IoResultExt, Result};

use crate::order::RecordSink;

/// Standard output or a file opened for writing.
///
/// A file stream is flushed and closed when dropped, including on error
/// paths; [`OutputStream::finish`] reports flush errors instead.
pub enum OutputStream {
    Stdout(Stdout),
    File { writer: BufWriter<File>, path: PathBuf },
}

impl OutputStream {
    /// Open `path` for writing, or standard output when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_path(parent)?;
                }
                let file = File::create(path).with_path(path)?;
                Ok(OutputStream::File {
                    writer: BufWriter::new(file),
                    path: path.to_path_buf(),
                })
            }
            None => Ok(OutputStream::Stdout(std::io::stdout())),
        }
    }

    pub fn finish(mut self) -> Result<()> {
        match &mut self {
            OutputStream::Stdout(out) => out.flush()?,
            OutputStream::File { writer, path } => writer.flush().with_path(&*path)?,
        }
        Ok(())
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutputStream::Stdout(out) => out.write(buf),
            OutputStream::File { writer, .. } => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutputStream::Stdout(out) => out.flush(),
            OutputStream::File { writer, .. } => writer.flush(),
        }
    }
}

/// Writes each record as one line.
pub struct LineWriter<W> {
    inner: W,
    lines: usize,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, lines: 0 }
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> RecordSink<String> for LineWriter<W> {
    fn write(&mut self, record: String) -> Result<()> {
        self.inner.write_all(record.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }
}

/// Format a scored output line:
/// `score ||| sentence [||| token scores] [||| alignments]`.
///
/// `attention` rows are target positions and columns source positions.
/// Hard alignments print `src-tgt` pairs of the row argmax; soft alignments
/// print every row, rows separated by ` ; `.
pub fn format_translation_output(
    sentence: &str,
    score: Option<f32>,
    token_level_scores: Option<&[f32]>,
    attention: Option<&[Vec<f32>]>,
    alignment_type: Option<AlignmentType>,
) -> String {
    let mut line = match score {
        Some(score) => format!("{:.6} ||| {}", score, sentence),
        None => sentence.to_string(),
    };
    if let Some(scores) = token_level_scores {
        let scores: Vec<String> = scores.iter().map(|s| format!("{:.6}", s)).collect();
        line.push_str(" ||| ");
        line.push_str(&scores.join(" "));
    }
    if let (Some(attention), Some(alignment_type)) = (attention, alignment_type) {
        let alignments = match alignment_type {
            AlignmentType::Hard => attention
                .iter()
                .enumerate()
                .map(|(target, row)| format!("{}-{}", argmax(row), target))
                .collect::<Vec<_>>()
                .join(" "),
            AlignmentType::Soft => attention
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|w| format!("{:.6}", w))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join(" ; "),
        };
        line.push_str(" ||| ");
        line.push_str(&alignments);
    }
    line
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &w)| if w > best.1 { (i, w) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_and_sentence() {
        assert_eq!(
            format_translation_output("a b", Some(-1.5), None, None, None),
            "-1.500000 ||| a b"
        );
        assert_eq!(format_translation_output("a b", None, None, None, None), "a b");
    }

    #[test]
    fn test_token_scores_and_hard_alignments() {
        let attention = vec![vec![0.1, 0.9], vec![0.7, 0.3], vec![0.5, 0.5]];
        let line = format_translation_output(
            "x y",
            Some(2.0),
            Some(&[0.5, 1.25, 0.25][..]),
            Some(attention.as_slice()),
            Some(AlignmentType::Hard),
        );
        assert_eq!(line, "2.000000 ||| x y ||| 0.500000 1.250000 0.250000 ||| 1-0 0-1 0-2");
    }

    #[test]
    fn test_soft_alignments() {
        let attention = vec![vec![0.25, 0.75], vec![1.0, 0.0]];
        let line =
            format_translation_output("x", Some(0.0), None, Some(attention.as_slice()), Some(AlignmentType::Soft));
        assert_eq!(line, "0.000000 ||| x ||| 0.250000 0.750000 ; 1.000000 0.000000");
    }

    #[test]
    fn test_alignments_need_attention() {
        let line = format_translation_output("x", Some(1.0), None, None, Some(AlignmentType::Hard));
        assert_eq!(line, "1.000000 ||| x");
    }

    #[test]
    fn test_file_stream_is_closed_on_drop() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("out/lines.txt");
        {
            let mut writer = LineWriter::new(OutputStream::open(Some(path.as_path()))?);
            writer.write("first".to_string())?;
            writer.write("second".to_string())?;
            assert_eq!(writer.lines(), 2);
        }
        assert_eq!(std::fs::read_to_string(&path)?, "first\nsecond\n");
        Ok(())
    }
}
