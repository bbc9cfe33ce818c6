use super::PredictionSink;
use crate::error::DumpError;
use crate::segmentation::Mask;
use crate::source::FrameId;
use image::ImageFormat;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

/// Writes predictions as 8-bit PNGs under `<root>/<sequence>/<frame>.png`
///
/// Directories are created on first write; existing files are never replaced.
pub struct PngFrameDump {
    root: PathBuf,
}

impl PngFrameDump {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        tracing::info!("Dumping predictions to {}", root.display());
        Self { root }
    }

    pub fn path_for(&self, frame: &FrameId) -> PathBuf {
        self.root
            .join(&frame.sequence)
            .join(format!("{}.png", frame.name))
    }
}

impl PredictionSink for PngFrameDump {
    fn write_prediction(&self, frame: &FrameId, prediction: &Mask) -> Result<(), DumpError> {
        let path = self.path_for(frame);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;
        }
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;

        encode_png(prediction, file, &path)?;

        tracing::debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// Encode and flush; a failed flush is reported rather than lost on drop
fn encode_png<W: Write + Seek>(prediction: &Mask, writer: W, path: &Path) -> Result<(), DumpError> {
    let mut writer = BufWriter::new(writer);
    prediction
        .to_image()
        .write_to(&mut writer, ImageFormat::Png)
        .map_err(|source| DumpError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush().map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> DumpError {
    DumpError::Io {
        path: path.to_path_buf(),
        source,
    }
}
