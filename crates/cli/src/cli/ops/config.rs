use clap::Args;

use harness::config::ConfigError;

/// Print the effective configuration as TOML
#[derive(Args, Debug, Clone)]
pub struct Config;

#[async_trait::async_trait]
impl crate::cli::op::Op for Config {
    type Error = ConfigError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let source = match &ctx.config_path {
            Some(path) => format!("# loaded from {}\n", path.display()),
            None => "# built-in defaults\n".to_string(),
        };
        Ok(format!("{}{}", source, ctx.config.to_toml()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::op::{Op, OpContext};

    #[tokio::test]
    async fn test_config_output_parses_back() {
        let ctx = OpContext::new(None).unwrap();
        let output = Config.execute(&ctx).await.unwrap();

        assert!(output.starts_with("# built-in defaults"));
        let parsed: harness::config::HarnessConfig = toml::from_str(&output).unwrap();
        assert_eq!(parsed.home_env_var, ctx.config.home_env_var);
    }
}
