use std::{convert::TryFrom, env, sync::Arc};

use enumn::N;
use log::warn;
use thiserror::Error;

use crate::{report::Report, BufferProperties};

/// Name of the environment variable read by `QueueConfig::from_env()`.
pub const NBUFFERS_ENV: &str = "SWAPR_NBUFFERS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported swap depth {0}, only 2 and 3 buffers are supported")]
    InvalidDepth(u32),
}

/// Number of buffers a `BufferQueue` cycles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, N)]
#[repr(u32)]
pub enum SwapDepth {
    /// The client waits for the compositor to be done with its previous frame
    /// before it can render the next one.
    Double = 2,
    /// The client can render one frame ahead of the one being composited.
    #[default]
    Triple = 3,
}

impl SwapDepth {
    pub fn num_buffers(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for SwapDepth {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        SwapDepth::n(value).ok_or(ConfigError::InvalidDepth(value))
    }
}

impl From<SwapDepth> for u32 {
    fn from(depth: SwapDepth) -> Self {
        depth as u32
    }
}

/// Parameters of a new `BufferQueue`.
#[derive(Clone)]
pub struct QueueConfig {
    pub(super) properties: BufferProperties,
    pub(super) depth: SwapDepth,
    pub(super) report: Option<Arc<dyn Report>>,
}

impl QueueConfig {
    /// Configuration of a triple-buffered queue of buffers matching
    /// `properties`.
    pub fn new(properties: BufferProperties) -> Self {
        QueueConfig {
            properties,
            depth: Default::default(),
            report: None,
        }
    }

    /// Same as `new`, but the depth is taken from the `SWAPR_NBUFFERS`
    /// environment variable: "2" selects double buffering, anything else
    /// triple buffering.
    pub fn from_env(properties: BufferProperties) -> Self {
        let depth = depth_from_var(env::var(NBUFFERS_ENV).ok().as_deref());
        Self::new(properties).depth(depth)
    }

    pub fn depth(self, depth: SwapDepth) -> Self {
        QueueConfig { depth, ..self }
    }

    /// Report the queue's diagnostics to `report` instead of the log.
    pub fn report(self, report: Arc<dyn Report>) -> Self {
        QueueConfig {
            report: Some(report),
            ..self
        }
    }
}

fn depth_from_var(value: Option<&str>) -> SwapDepth {
    match value {
        Some("2") => SwapDepth::Double,
        Some("3") | None => SwapDepth::Triple,
        Some(other) => {
            warn!(
                "Ignoring invalid {} value {:?}, using {} buffers",
                NBUFFERS_ENV,
                other,
                SwapDepth::Triple.num_buffers()
            );
            SwapDepth::Triple
        }
    }
}
