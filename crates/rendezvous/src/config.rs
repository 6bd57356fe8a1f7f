use std::net::SocketAddr;

use protocol::{AppError, AppResult};

const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    pub listen_addr: SocketAddr,
}

impl RendezvousConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_values(trimmed_env("DROPWIRE_LISTEN_ADDR"), trimmed_env("PORT"))
    }

    fn from_values(listen_addr: Option<String>, port: Option<String>) -> AppResult<Self> {
        if let Some(value) = listen_addr {
            let addr = value.parse::<SocketAddr>().map_err(|error| {
                AppError::new("config_listen_addr_invalid", "监听地址格式不正确")
                    .with_context("listenAddr", value.clone())
                    .with_cause(error.to_string())
            })?;
            return Ok(Self { listen_addr: addr });
        }

        let port = match port {
            Some(value) => value.parse::<u16>().map_err(|error| {
                AppError::new("config_port_invalid", "端口格式不正确")
                    .with_context("port", value.clone())
                    .with_cause(error.to_string())
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        })
    }
}

fn trimmed_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_values_should_default_to_port_3000() {
        let config = RendezvousConfig::from_values(None, None).expect("default config");
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 3000)));
    }

    #[test]
    fn from_values_should_prefer_full_listen_addr() {
        let config =
            RendezvousConfig::from_values(Some("127.0.0.1:8080".to_string()), Some("9000".to_string()))
                .expect("explicit addr");
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().expect("addr"));
    }

    #[test]
    fn from_values_should_use_port_override() {
        let config = RendezvousConfig::from_values(None, Some("4321".to_string()))
            .expect("port override");
        assert_eq!(config.listen_addr.port(), 4321);
    }

    #[test]
    fn from_values_should_reject_malformed_input() {
        let error = RendezvousConfig::from_values(Some("nonsense".to_string()), None)
            .expect_err("bad addr");
        assert_eq!(error.code, "config_listen_addr_invalid");

        let error = RendezvousConfig::from_values(None, Some("70000".to_string()))
            .expect_err("bad port");
        assert_eq!(error.code, "config_port_invalid");
    }
}
