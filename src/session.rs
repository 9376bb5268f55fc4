use crate::consts::{FORMAT_WRITE_BUFFER_SIZE, MAX_SECTOR_SIZE};
use crate::error::{FormatError, Result};
use crate::rng::{OsRandom, RandomSource};

/// When to run device writes on a separate thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteThreadMode {
    /// Devices only; container files are written synchronously.
    #[default]
    Auto,
    Always,
    Never,
}

/// Tunables for a [`FormatSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bytes encrypted and written per device write. Multiple of the largest sector size.
    pub write_buffer_size: usize,
    pub write_thread: WriteThreadMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig { write_buffer_size: FORMAT_WRITE_BUFFER_SIZE, write_thread: WriteThreadMode::Auto }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 || self.write_buffer_size % MAX_SECTOR_SIZE as usize != 0 {
            return Err(FormatError::ParameterIncorrect("write buffer size must be a multiple of 4096"));
        }
        Ok(())
    }
}

/// State that lives for one format call: buffer sizing, writer policy and the RNG.
pub struct FormatSession {
    config: SessionConfig,
    rng: Box<dyn RandomSource>,
}

impl FormatSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_rng(config, Box::new(OsRandom))
    }

    pub fn with_rng(config: SessionConfig, rng: Box<dyn RandomSource>) -> Result<Self> {
        config.validate()?;
        Ok(FormatSession { config, rng })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn write_buffer_size(&self) -> usize {
        self.config.write_buffer_size
    }

    pub fn use_write_thread(&self, is_device: bool) -> bool {
        match self.config.write_thread {
            WriteThreadMode::Auto => is_device,
            WriteThreadMode::Always => true,
            WriteThreadMode::Never => false,
        }
    }

    pub fn rng(&mut self) -> &mut dyn RandomSource {
        self.rng.as_mut()
    }
}

impl Default for FormatSession {
    fn default() -> Self {
        FormatSession { config: SessionConfig::default(), rng: Box::new(OsRandom) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.write_buffer_size, 1024 * 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn odd_buffer_sizes_are_rejected() {
        for size in [0, 512, 5000] {
            let cfg = SessionConfig { write_buffer_size: size, ..Default::default() };
            assert!(FormatSession::new(cfg).is_err(), "{size}");
        }
    }

    #[test]
    fn write_thread_policy() {
        let auto = FormatSession::default();
        assert!(auto.use_write_thread(true));
        assert!(!auto.use_write_thread(false));

        let always = FormatSession::new(SessionConfig { write_thread: WriteThreadMode::Always, ..Default::default() })
            .unwrap();
        assert!(always.use_write_thread(false));
    }
}
