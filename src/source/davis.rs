use super::{Frame, FrameId, SequenceSource};
use crate::error::ResourceError;
use crate::segmentation::Mask;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// DAVIS-style directory layout
///
/// `<root>/JPEGImages/<resolution>/<seq>/<frame>.jpg` with annotations at
/// `<root>/Annotations/<resolution>/<seq>/<frame>.png`.
pub struct DavisSource {
    images: PathBuf,
    annotations: PathBuf,
    sequence_list: Option<PathBuf>,
}

impl DavisSource {
    pub fn new<P: AsRef<Path>>(root: P, resolution: &str) -> Self {
        let root = root.as_ref();
        tracing::info!("Reading sequences from {} ({})", root.display(), resolution);
        Self {
            images: root.join("JPEGImages").join(resolution),
            annotations: root.join("Annotations").join(resolution),
            sequence_list: None,
        }
    }

    /// Restrict evaluation to the ids listed in a text file, one per line
    pub fn with_sequence_list<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sequence_list = Some(path.as_ref().to_path_buf());
        self
    }

    /// Resolves the file through the same listing `frames` uses
    fn image_path(&self, id: &FrameId) -> Result<PathBuf, ResourceError> {
        let dir = self.images.join(&id.sequence);
        image_files(&dir)?
            .into_iter()
            .find(|(name, _)| *name == id.name)
            .map(|(_, path)| path)
            .ok_or_else(|| ResourceError::Io {
                path: dir.join(&id.name),
                source: ErrorKind::NotFound.into(),
            })
    }

    fn load_annotation(&self, id: &FrameId) -> Result<Option<Mask>, ResourceError> {
        let path = self
            .annotations
            .join(&id.sequence)
            .join(format!("{}.png", id.name));
        if !path.exists() {
            return Ok(None);
        }
        let annotation = image::open(&path)
            .map_err(|source| ResourceError::Decode { path, source })?
            .to_luma8();
        Ok(Some(Mask::from_annotation(&annotation)))
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, ResourceError> {
    let io_err = |source| ResourceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort();
    Ok(entries)
}

/// Frame images of one sequence as (stem, path), sorted by path
///
/// Extensions match case-insensitively. A stem present under several
/// extensions keeps the first path in sorted order.
fn image_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, ResourceError> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for path in read_dir_sorted(dir)? {
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some((_, kept)) = files.iter().find(|(seen, _)| seen == name) {
            tracing::warn!("Ignoring {}: frame already read from {}", path.display(), kept.display());
            continue;
        }
        files.push((name.to_string(), path));
    }
    Ok(files)
}

impl SequenceSource for DavisSource {
    fn sequence_ids(&self) -> Result<Vec<String>, ResourceError> {
        if let Some(list) = &self.sequence_list {
            let contents = fs::read_to_string(list).map_err(|source| ResourceError::Io {
                path: list.clone(),
                source,
            })?;
            return Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect());
        }

        Ok(read_dir_sorted(&self.images)?
            .into_iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| path.file_name()?.to_str().map(String::from))
            .collect())
    }

    fn frames(&self, sequence_id: &str) -> Result<Vec<FrameId>, ResourceError> {
        let frames: Vec<FrameId> = image_files(&self.images.join(sequence_id))?
            .into_iter()
            .enumerate()
            .map(|(index, (name, _))| FrameId {
                sequence: sequence_id.to_string(),
                index,
                name,
            })
            .collect();

        if frames.is_empty() {
            return Err(ResourceError::EmptySequence);
        }
        Ok(frames)
    }

    fn load_frame(&self, id: &FrameId) -> Result<Frame, ResourceError> {
        let path = self.image_path(id)?;
        let image = image::open(&path)
            .map_err(|source| ResourceError::Decode { path, source })?
            .to_rgb8();
        let ground_truth = self.load_annotation(id)?;

        Ok(Frame {
            id: id.clone(),
            image,
            ground_truth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn write_frame(root: &Path, seq: &str, name: &str, with_annotation: bool) {
        let images = root.join("JPEGImages/480p").join(seq);
        let annotations = root.join("Annotations/480p").join(seq);
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&annotations).unwrap();
        RgbImage::new(6, 4)
            .save(images.join(format!("{name}.png")))
            .unwrap();
        if with_annotation {
            let mut annotation = GrayImage::new(6, 4);
            annotation.put_pixel(2, 1, Luma([255]));
            annotation.put_pixel(3, 1, Luma([7]));
            annotation.save(annotations.join(format!("{name}.png"))).unwrap();
        }
    }

    #[test]
    fn test_enumerates_sequences_and_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "cows", "00001", true);
        write_frame(dir.path(), "cows", "00000", true);
        write_frame(dir.path(), "bear", "00000", true);

        let source = DavisSource::new(dir.path(), "480p");
        assert_eq!(source.sequence_ids().unwrap(), vec!["bear", "cows"]);

        let frames = source.frames("cows").unwrap();
        let names: Vec<_> = frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["00000", "00001"]);
        assert_eq!(frames[1].index, 1);
    }

    #[test]
    fn test_uppercase_extension_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "cows", "00001", false);
        let images = dir.path().join("JPEGImages/480p/cows");
        fs::rename(images.join("00001.png"), images.join("00001.PNG")).unwrap();
        RgbImage::new(6, 4)
            .save_with_format(images.join("00000.JPG"), image::ImageFormat::Jpeg)
            .unwrap();

        let source = DavisSource::new(dir.path(), "480p");
        let frames = source.frames("cows").unwrap();
        let names: Vec<_> = frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["00000", "00001"]);
        for frame in &frames {
            assert_eq!(source.load_frame(frame).unwrap().image.dimensions(), (6, 4));
        }
    }

    #[test]
    fn test_repeated_stem_listed_once() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "cows", "00000", true);
        write_frame(dir.path(), "cows", "00001", true);
        RgbImage::new(3, 2)
            .save_with_format(dir.path().join("JPEGImages/480p/cows/00000.jpg"), image::ImageFormat::Jpeg)
            .unwrap();

        let source = DavisSource::new(dir.path(), "480p");
        let frames = source.frames("cows").unwrap();
        let names: Vec<_> = frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["00000", "00001"]);
        assert_eq!(frames[1].index, 1);
        // `00000.jpg` sorts before `00000.png`
        assert_eq!(source.load_frame(&frames[0]).unwrap().image.dimensions(), (3, 2));
    }

    #[test]
    fn test_annotation_remapped_and_optional() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "cows", "00000", true);
        write_frame(dir.path(), "cows", "00001", false);

        let source = DavisSource::new(dir.path(), "480p");
        let frames = source.frames("cows").unwrap();

        let first = source.load_frame(&frames[0]).unwrap();
        let mask = first.ground_truth.unwrap();
        assert_eq!(mask.foreground_count(), 1);
        assert!(mask.get(2, 1));
        assert_eq!(first.image.dimensions(), (6, 4));

        let second = source.load_frame(&frames[1]).unwrap();
        assert!(second.ground_truth.is_none());
    }

    #[test]
    fn test_corrupt_annotation_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "cows", "00000", false);
        fs::write(dir.path().join("Annotations/480p/cows/00000.png"), b"not a png").unwrap();

        let source = DavisSource::new(dir.path(), "480p");
        let frames = source.frames("cows").unwrap();
        assert!(matches!(
            source.load_frame(&frames[0]),
            Err(ResourceError::Decode { .. })
        ));
    }

    #[test]
    fn test_sequence_list_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("val_seqs.txt");
        fs::write(&list, "cows\n\n  bear \n").unwrap();
        let source = DavisSource::new(dir.path(), "480p").with_sequence_list(&list);
        assert_eq!(source.sequence_ids().unwrap(), vec!["cows", "bear"]);
    }

    #[test]
    fn test_missing_sequence_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = DavisSource::new(dir.path(), "480p");
        assert!(matches!(source.frames("nope"), Err(ResourceError::Io { .. })));
    }
}
