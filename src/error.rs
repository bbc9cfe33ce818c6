use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A typed buffer was built with the wrong shape or contents
#[derive(Debug, Error, PartialEq)]
pub enum ShapeError {
    #[error("{what}: expected {expected_width}x{expected_height}, got {width}x{height}")]
    Dimensions {
        what: &'static str,
        expected_width: usize,
        expected_height: usize,
        width: usize,
        height: usize,
    },

    #[error("{what}: expected {expected} channels, got {actual}")]
    Channels {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("mask contains label {0}, only 0 and 1 are allowed")]
    InvalidLabel(u8),

    #[error("score map needs at least 2 classes, got {0}")]
    TooFewClasses(usize),

    #[error("{what} must not be empty")]
    Empty { what: &'static str },
}

/// Local resource failures: fatal to the sequence, never to the model
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("seed frame has no ground truth annotation")]
    MissingSeed,

    #[error("sequence has no frames")]
    EmptySequence,

    #[error("annotation does not match its frame")]
    Annotation(#[source] ShapeError),
}

/// Failures of the inference backend: fatal to the run
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model returned shape {actual:?}, expected [1, classes, h, w]")]
    OutputShape { actual: Vec<usize> },

    #[error("inference took {elapsed:?}, limit is {limit:?}")]
    Stalled { elapsed: Duration, limit: Duration },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Could not write a frame dump
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("failed to create {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Run-level error, always tagged with enough context to reproduce
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("sequence {sequence} frame {frame}: {source}")]
    Resource {
        sequence: String,
        frame: String,
        #[source]
        source: ResourceError,
    },

    #[error("sequence {sequence} frame {frame}: model failure: {source}")]
    Model {
        sequence: String,
        frame: String,
        #[source]
        source: ModelError,
    },

    #[error("sequence {sequence} frame {frame}: {source}")]
    Shape {
        sequence: String,
        frame: String,
        #[source]
        source: ShapeError,
    },

    #[error("sequence {sequence} frame {frame}: {source}")]
    Dump {
        sequence: String,
        frame: String,
        #[source]
        source: DumpError,
    },

    #[error("failed to write report {}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sequence id {0:?} collides with the total entry of the result record")]
    ReservedSequenceId(String),

    #[error("failed to build worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl EvalError {
    /// True for errors that only invalidate one sequence
    pub fn is_resource(&self) -> bool {
        matches!(self, EvalError::Resource { .. })
    }
}
