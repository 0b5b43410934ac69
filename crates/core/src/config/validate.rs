use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Converter queue, timeout and encode settings are usable
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let converter = &config.converter;
    if converter.queue_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "converter.queue_capacity must be at least 1".to_string(),
        ));
    }
    if converter.worker_count == Some(0) {
        return Err(ConfigError::ValidationError(
            "converter.worker_count must be at least 1 when set".to_string(),
        ));
    }
    if converter.task_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "converter.task_timeout_secs cannot be 0".to_string(),
        ));
    }
    if !(1..=100).contains(&converter.quality) {
        return Err(ConfigError::ValidationError(format!(
            "converter.quality must be within 1..=100, got {}",
            converter.quality
        )));
    }
    if converter.min_quality == 0 || converter.min_quality > converter.quality {
        return Err(ConfigError::ValidationError(format!(
            "converter.min_quality must be within 1..={}, got {}",
            converter.quality, converter.min_quality
        )));
    }
    if converter.max_encode_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "converter.max_encode_attempts must be at least 1".to_string(),
        ));
    }
    if converter.progress_queue_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "converter.progress_queue_capacity must be at least 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::converter::ConverterConfig;
    use std::net::IpAddr;

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse::<IpAddr>().unwrap(),
                port: 0,
            },
            ..Default::default()
        };
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_zero_queue_capacity_fails() {
        let config = Config {
            converter: ConverterConfig::default().with_queue_capacity(0),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_quality_out_of_range_fails() {
        let config = Config {
            converter: ConverterConfig::default().with_quality(101),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_min_quality_above_quality_fails() {
        let mut converter = ConverterConfig::default().with_quality(40);
        converter.min_quality = 50;
        let config = Config {
            converter,
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("min_quality"));
    }

    #[test]
    fn test_validate_zero_worker_override_fails() {
        let config = Config {
            converter: ConverterConfig::default().with_workers(0),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
