use std::error::Error;
use std::path::PathBuf;

use harness::config::{ConfigError, HarnessConfig};

/// Load the harness config.
///
/// Priority: environment overrides > `--config` file > built-in defaults.
pub fn resolve_config(config_path: Option<&PathBuf>) -> Result<HarnessConfig, ConfigError> {
    match config_path {
        Some(path) => HarnessConfig::load(path)?.with_env_overrides(),
        None => HarnessConfig::from_env(),
    }
}

#[derive(Clone)]
pub struct OpContext {
    /// Effective harness configuration
    pub config: HarnessConfig,
    /// Where the configuration came from, if not the defaults
    pub config_path: Option<PathBuf>,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Ok(Self {
            config: resolve_config(config_path.as_ref())?,
            config_path,
        })
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "startup_timeout_ms = 1234\nforward_output = false\n").unwrap();

        let ctx = OpContext::new(Some(path.clone())).unwrap();
        assert_eq!(ctx.config.startup_timeout_ms, 1234);
        assert_eq!(ctx.config_path, Some(path));
    }

    #[test]
    fn test_resolve_config_missing_file() {
        let result = resolve_config(Some(&PathBuf::from("/nonexistent/harness.toml")));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_resolve_config_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "probe_interval_ms = 0\n").unwrap();

        assert!(matches!(
            resolve_config(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
