//! Rambrain is configured once, at manager construction, through a
//! [`Config`] built with [`ConfigBuilder`].  Every knob named in the
//! external interface lives here, validated before it ever reaches
//! the manager or the swap engine.
use crate::error::RambrainError;

/// Governs what happens when a `SwapBackend` runs out of preallocated
/// room for a new placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapPolicy {
    /// Fail the allocation; the swap-file set never grows.
    Fixed,
    /// Grow the swap-file set by the deficit, as long as the backing
    /// filesystem has room.
    AutoExtendable,
    /// Like `AutoExtendable`, but prompts on stdin for the number of
    /// extra `fileSize` steps to add before retrying.  Intended for
    /// interactive/test use, not production services.
    Interactive,
}

const DEFAULT_SWAP_OUT_FRACTION: f64 = 0.8;
const DEFAULT_SWAP_IN_FRACTION: f64 = 0.9;
const DEFAULT_PREEMPTIVE_TURNOFF_FRACTION: f64 = 0.01;
const DEFAULT_RESIZE_FRACTION: f64 = 0.1;
const MIN_FILE_SIZE: usize = 1 << 20;

/// An immutable, validated configuration snapshot.
#[derive(Clone, Debug)]
pub struct Config {
    pub memory_ceiling: usize,
    pub swap_ceiling: usize,
    pub file_size: usize,
    pub swap_policy: SwapPolicy,
    pub dma: bool,
    pub preemptive_load: bool,
    pub swap_out_fraction: f64,
    pub swap_in_fraction: f64,
    pub preemptive_turnoff_fraction: f64,
    pub resize_fraction: f64,
    pub(crate) file_name_template: String,
}

/// Builds a [`Config`] by chaining setters and validating everything
/// in a single terminal `build()` call.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    memory_ceiling: usize,
    swap_ceiling: usize,
    file_size: Option<usize>,
    swap_policy: SwapPolicy,
    dma: bool,
    preemptive_load: bool,
    swap_out_fraction: f64,
    swap_in_fraction: f64,
    preemptive_turnoff_fraction: f64,
    resize_fraction: f64,
    file_name_template: String,
}

impl ConfigBuilder {
    /// Starts a builder with the two mandatory ceilings; everything
    /// else defaults per the external interface section of the
    /// design.
    pub fn new(memory_ceiling: usize, swap_ceiling: usize) -> Self {
        Self {
            memory_ceiling,
            swap_ceiling,
            file_size: None,
            swap_policy: SwapPolicy::Fixed,
            dma: false,
            preemptive_load: true,
            swap_out_fraction: DEFAULT_SWAP_OUT_FRACTION,
            swap_in_fraction: DEFAULT_SWAP_IN_FRACTION,
            preemptive_turnoff_fraction: DEFAULT_PREEMPTIVE_TURNOFF_FRACTION,
            resize_fraction: DEFAULT_RESIZE_FRACTION,
            file_name_template: format!("{}/rambrainswap-{}", std::env::temp_dir().display(), std::process::id()),
        }
    }

    pub fn file_size(mut self, bytes: usize) -> Self {
        self.file_size = Some(bytes);
        self
    }

    pub fn swap_policy(mut self, policy: SwapPolicy) -> Self {
        self.swap_policy = policy;
        self
    }

    pub fn dma(mut self, enabled: bool) -> Self {
        self.dma = enabled;
        self
    }

    pub fn preemptive_load(mut self, enabled: bool) -> Self {
        self.preemptive_load = enabled;
        self
    }

    pub fn file_name_template(mut self, template: impl Into<String>) -> Self {
        self.file_name_template = template.into();
        self
    }

    pub fn swap_out_fraction(mut self, frac: f64) -> Self {
        self.swap_out_fraction = frac;
        self
    }

    pub fn swap_in_fraction(mut self, frac: f64) -> Self {
        self.swap_in_fraction = frac;
        self
    }

    pub fn preemptive_turnoff_fraction(mut self, frac: f64) -> Self {
        self.preemptive_turnoff_fraction = frac;
        self
    }

    /// Validates every field and produces an immutable [`Config`].
    pub fn build(self) -> Result<Config, RambrainError> {
        if self.memory_ceiling == 0 {
            return Err(RambrainError::Config(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "memory ceiling must be non-zero",
            )));
        }

        let file_size = self
            .file_size
            .unwrap_or_else(|| (self.swap_ceiling / 16).max(MIN_FILE_SIZE))
            .max(MIN_FILE_SIZE);
        // DMA mode opens files O_DIRECT, which requires page-aligned
        // offsets/lengths; rounding every file up to a whole number of
        // pages keeps that true unconditionally, not just when DMA
        // happens to be on at construction time.
        let page = crate::map::page_size();
        let file_size = (file_size + page - 1) / page * page;

        if !(0.0..=1.0).contains(&self.swap_out_fraction)
            || !(0.0..=1.0).contains(&self.swap_in_fraction)
            || !(0.0..=1.0).contains(&self.preemptive_turnoff_fraction)
        {
            return Err(RambrainError::Config(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "eviction fractions must be in [0, 1]",
            )));
        }

        Ok(Config {
            memory_ceiling: self.memory_ceiling,
            swap_ceiling: self.swap_ceiling,
            file_size,
            swap_policy: self.swap_policy,
            dma: self.dma,
            preemptive_load: self.preemptive_load,
            swap_out_fraction: self.swap_out_fraction,
            swap_in_fraction: self.swap_in_fraction,
            preemptive_turnoff_fraction: self.preemptive_turnoff_fraction,
            resize_fraction: self.resize_fraction,
            file_name_template: self.file_name_template,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ConfigBuilder::new(16 << 20, 256 << 20).build().expect("should build");
        assert_eq!(config.swap_policy, SwapPolicy::Fixed);
        assert!(config.file_size >= MIN_FILE_SIZE);
    }

    #[test]
    fn zero_ceiling_rejected() {
        assert!(ConfigBuilder::new(0, 1 << 20).build().is_err());
    }

    #[test]
    fn bad_fraction_rejected() {
        assert!(ConfigBuilder::new(1 << 20, 1 << 20)
            .swap_out_fraction(1.5)
            .build()
            .is_err());
    }
}
