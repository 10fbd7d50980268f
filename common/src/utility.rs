use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::configuration::{Config, ConfigError};

pub fn parse_configuration<P: AsRef<Path>>(config_file: P) -> Result<Config, ConfigError> {
    let file = File::open(config_file.as_ref())?;
    log::debug!("Parsing configuration file: {}", config_file.as_ref().display());
    parse_configuration_from(file)
}

/// Parses the line-oriented format:
///
/// ```text
/// # comment
/// f 1
/// timeout 500
/// logdir /var/lib/paxos
/// replica 127.0.0.1:32001
/// replica 127.0.0.1:32002
/// replica 127.0.0.1:32003
/// ```
pub fn parse_configuration_from<R: Read>(input: R) -> Result<Config, ConfigError> {
    let reader = BufReader::new(input);

    let mut f: Option<usize> = None;
    let mut replicas = Vec::new();
    let mut rpc_timeout = None;
    let mut log_dir = None;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        let tokens: Vec<_> = line.split_whitespace().collect();
        if tokens.is_empty() || tokens[0].starts_with('#') {
            continue; // Skip comments and empty lines
        }

        let directive = tokens[0];
        let arg = match tokens.get(1) {
            Some(arg) => *arg,
            None => {
                return Err(ConfigError::BadValue {
                    line: line_no,
                    directive: directive.to_string(),
                    reason: "missing argument".to_string(),
                })
            }
        };
        let bad_value = |reason: String| ConfigError::BadValue {
            line: line_no,
            directive: directive.to_string(),
            reason,
        };

        match directive {
            "f" => {
                f = Some(arg.parse().map_err(|e| bad_value(format!("{}", e)))?);
            }
            "replica" => {
                if replicas.iter().any(|r| r == arg) {
                    return Err(bad_value(format!("duplicate replica {}", arg)));
                }
                replicas.push(arg.to_string());
            }
            "timeout" => {
                let ms: u64 = arg.parse().map_err(|e| bad_value(format!("{}", e)))?;
                if ms == 0 {
                    return Err(bad_value("timeout must be positive".to_string()));
                }
                rpc_timeout = Some(Duration::from_millis(ms));
            }
            "logdir" => {
                log_dir = Some(PathBuf::from(arg));
            }
            _ => {
                return Err(ConfigError::UnknownDirective {
                    line: line_no,
                    directive: directive.to_string(),
                });
            }
        }
    }

    if replicas.is_empty() {
        return Err(ConfigError::NoReplicas);
    }

    if let Some(f) = f {
        if replicas.len() < 2 * f + 1 {
            return Err(ConfigError::BadValue {
                line: 0,
                directive: "f".to_string(),
                reason: format!("{} replicas cannot tolerate {} failures", replicas.len(), f),
            });
        }
    }

    let mut config = Config::new(replicas);
    if let Some(timeout) = rpc_timeout {
        config.rpc_timeout = timeout;
    }
    if let Some(dir) = log_dir {
        config.log_dir = dir;
    }
    Ok(config)
}
