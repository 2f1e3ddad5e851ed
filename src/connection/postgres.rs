//! Pool construction for the PostgreSQL results store

use anyhow::{Context, Result, anyhow};
use log::debug;
use native_tls::{Certificate, Identity, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::fs;

use crate::config::{DatabaseConfig, SslMode};

/// Create a connection pool for the results database.
/// No connection is opened until a client is requested.
pub fn create_pool(config: &DatabaseConfig) -> Result<deadpool_postgres::Pool> {
    let pg_config = pg_config(config);

    let manager = match config.ssl_mode {
        SslMode::Disable => {
            debug!("Results pool for {} without TLS", config.host);
            deadpool_postgres::Manager::new(pg_config, tokio_postgres::NoTls)
        }
        mode => {
            debug!("Results pool for {} with TLS ({:?})", config.host, mode);
            let tls = MakeTlsConnector::new(tls_connector(config)?);
            deadpool_postgres::Manager::new(pg_config, tls)
        }
    };

    deadpool_postgres::Pool::builder(manager)
        .max_size(config.pool_size.max(1))
        .build()
        .context("Failed to create connection pool")
}

fn pg_config(config: &DatabaseConfig) -> tokio_postgres::Config {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.name)
        .user(&config.username)
        .password(&config.password)
        .application_name("stressfront");
    pg_config
}

fn tls_connector(config: &DatabaseConfig) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();

    if let Some(path) = &config.ca_cert {
        let pem = read_pem(path, "CA certificate")?;
        builder.add_root_certificate(
            Certificate::from_pem(&pem).context("Invalid CA certificate format")?,
        );
    }

    match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = read_pem(cert_path, "client certificate")?;
            let key = read_pem(key_path, "client key")?;
            builder.identity(
                Identity::from_pkcs8(&cert, &key)
                    .context("Invalid client certificate or key format")?,
            );
        }
        (Some(_), None) => return Err(anyhow!("Client certificate given without a client key")),
        (None, Some(_)) => return Err(anyhow!("Client key given without a client certificate")),
        (None, None) => {}
    }

    let (invalid_certs, invalid_hostnames) = verification(config.ssl_mode);
    builder
        .danger_accept_invalid_certs(invalid_certs)
        .danger_accept_invalid_hostnames(invalid_hostnames);

    builder.build().context("Failed to build TLS connector")
}

/// Which checks are skipped for a mode: (certificate chain, hostname)
fn verification(mode: SslMode) -> (bool, bool) {
    match mode {
        SslMode::VerifyFull => (false, false),
        SslMode::VerifyCa => (false, true),
        _ => (true, true),
    }
}

fn read_pem(path: &str, what: &str) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {} certificate file {}", what, path))
}
