/// PostgreSQL connection pooling and TLS setup
pub mod postgres;
