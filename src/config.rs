use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub database_url: String,
    pub static_dir: String,
    pub send_queue_size: usize,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_level: "info".to_string(),
            database_url: "sqlite://delivery_tracking.db".to_string(),
            static_dir: "frontend".to_string(),
            send_queue_size: 256,
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let send_queue_size = parse_or_default("SEND_QUEUE_SIZE", defaults.send_queue_size)?;
        if send_queue_size == 0 {
            return Err(AppError::Internal(
                "invalid SEND_QUEUE_SIZE: must be > 0".to_string(),
            ));
        }

        let pong_wait_secs = parse_or_default("PONG_WAIT_SECS", defaults.pong_wait.as_secs())?;
        if pong_wait_secs == 0 {
            return Err(AppError::Internal(
                "invalid PONG_WAIT_SECS: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            static_dir: env::var("STATIC_DIR").unwrap_or(defaults.static_dir),
            send_queue_size,
            pong_wait: Duration::from_secs(pong_wait_secs),
            write_wait: Duration::from_secs(parse_or_default(
                "WRITE_WAIT_SECS",
                defaults.write_wait.as_secs(),
            )?),
        })
    }

    /// Liveness timings handed to every session pump.
    pub fn session_timing(&self) -> SessionTiming {
        SessionTiming::new(self.pong_wait, self.write_wait)
    }
}

/// Read deadline, write timeout and ping cadence for one connection.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub ping_period: Duration,
}

impl SessionTiming {
    pub fn new(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            pong_wait,
            write_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

impl Default for SessionTiming {
    fn default() -> Self {
        Config::default().session_timing()
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::SessionTiming;

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let timing = SessionTiming::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(timing.ping_period, Duration::from_secs(54));
    }

    #[test]
    fn default_timing_matches_transport_defaults() {
        let timing = SessionTiming::default();
        assert_eq!(timing.pong_wait, Duration::from_secs(60));
        assert_eq!(timing.write_wait, Duration::from_secs(10));
    }
}
