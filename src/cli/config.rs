//! Process-wide configuration: defaults, overridden by `MIDA_`-prefixed
//! environment variables, overridden in turn by CLI flags.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::amqp;
use crate::task::defaults;

/// Connection settings for the AMQP broker used by `load` and `client`.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub task_queue: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            user: "guest".to_string(),
            pass: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            tls: false,
            task_queue: amqp::DEFAULT_QUEUE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of parallel browser instances used for visiting
    pub crawlers: usize,
    /// Number of parallel workers storing task results
    pub storers: usize,
    pub monitor: bool,
    pub prom_port: u16,
    /// 0=Error, 1=Warn, 2=Info, 3=Debug
    pub log_level: u8,
    /// Root directory for per-task temporary state
    pub temp_dir: PathBuf,
    pub amqp: AmqpSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crawlers: 1,
            storers: 1,
            monitor: false,
            prom_port: 8001,
            log_level: 2,
            temp_dir: defaults::default_temp_dir(),
            amqp: AmqpSettings::default(),
        }
    }
}

impl Config {
    /// Builds the configuration from defaults plus any `MIDA_*` environment
    /// variables present. Unparseable values are warned about and ignored.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        apply_env("MIDA_CRAWLERS", &mut config.crawlers);
        apply_env("MIDA_STORERS", &mut config.storers);
        apply_env("MIDA_MONITOR", &mut config.monitor);
        apply_env("MIDA_PROM_PORT", &mut config.prom_port);
        apply_env("MIDA_LOG_LEVEL", &mut config.log_level);

        if let Ok(dir) = std::env::var("MIDA_TEMP_DIR") {
            if !dir.is_empty() {
                config.temp_dir = PathBuf::from(dir);
            }
        }

        if let Ok(user) = std::env::var("MIDA_AMQP_USER") {
            config.amqp.user = user;
        }
        if let Ok(pass) = std::env::var("MIDA_AMQP_PASS") {
            config.amqp.pass = pass;
        }
        if let Ok(host) = std::env::var("MIDA_AMQP_HOST") {
            config.amqp.host = host;
        }
        apply_env("MIDA_AMQP_PORT", &mut config.amqp.port);
        apply_env("MIDA_TLS", &mut config.amqp.tls);
        if let Ok(queue) = std::env::var("MIDA_AMQP_QUEUE") {
            config.amqp.task_queue = queue;
        }

        config
    }

    pub fn conn_params(&self) -> amqp::ConnParams {
        amqp::ConnParams {
            user: self.amqp.user.clone(),
            pass: self.amqp.pass.clone(),
            host: self.amqp.host.clone(),
            port: self.amqp.port,
            tls: self.amqp.tls,
        }
    }
}

fn apply_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(name, %value, "ignoring unparseable environment override"),
        }
    }
}
