//! PostgreSQL connection implementation

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row as PgRow};

use dbsync_core::{
    Connection, EndpointConfig, QueryResult, Result, Row, StatementResult, SyncError, Value,
};

fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let code = db_error.code();
    let mut message = db_error.message().to_string();

    if let Some(detail) = db_error.detail() {
        if !detail.trim().is_empty() {
            message.push_str(&format!(" (detail: {})", detail));
        }
    }

    if let Some(hint) = db_error.hint() {
        if !hint.trim().is_empty() {
            message.push_str(&format!(" (hint: {})", hint));
        }
    }

    match code.code() {
        "23505" => format!("duplicate value violates unique constraint: {}", message),
        "23503" => format!("foreign key violation: {}", message),
        "23502" => format!("null value violates not-null constraint: {}", message),
        "42P01" => format!("relation does not exist: {}", message),
        _ => format!("{} (code: {:?})", message, code),
    }
}

/// PostgreSQL connection wrapper.
///
/// One instance is held per side (source/target) for the lifetime of a
/// command; the engine issues strictly sequential statements over it.
pub struct PostgresConnection {
    client: Arc<Mutex<Client>>,
}

impl PostgresConnection {
    /// Connect to the endpoint, honoring its `ssl_mode`.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self> {
        let host = endpoint.effective_host();
        let port = endpoint.effective_port();

        tracing::info!(
            host = %host,
            port = %port,
            database = %endpoint.database,
            ssl_mode = %endpoint.ssl_mode,
            "connecting to PostgreSQL database"
        );

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(&endpoint.database)
            .user(&endpoint.username);
        if let Some(password) = &endpoint.password {
            config.password(password);
        }

        let ssl_mode = endpoint.ssl_mode.to_lowercase();
        config.ssl_mode(match ssl_mode.as_str() {
            "disable" => tokio_postgres::config::SslMode::Disable,
            "require" => tokio_postgres::config::SslMode::Require,
            _ => tokio_postgres::config::SslMode::Prefer,
        });

        let client = if ssl_mode == "disable" {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| SyncError::Connection(format!("failed to connect: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        } else {
            let tls_connector = TlsConnector::builder()
                // "prefer"/"require" do not verify the peer, matching libpq
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| SyncError::Connection(format!("failed to build TLS connector: {e}")))?;
            let tls = MakeTlsConnector::new(tls_connector);
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| SyncError::Connection(format!("failed to connect: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        };

        tracing::debug!(host = %host, port = %port, database = %endpoint.database, "PostgreSQL connection established");
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    fn to_sql_params(params: &[Value]) -> Result<Vec<Box<dyn ToSql + Sync + Send>>> {
        params
            .iter()
            .map(|value| -> Result<Box<dyn ToSql + Sync + Send>> {
                Ok(match value {
                    Value::Null => Box::new(Option::<String>::None),
                    Value::Bool(v) => Box::new(*v),
                    Value::Int16(v) => Box::new(*v),
                    Value::Int32(v) => Box::new(*v),
                    Value::Int64(v) => Box::new(*v),
                    Value::Float32(v) => Box::new(*v),
                    Value::Float64(v) => Box::new(*v),
                    Value::Decimal(v) | Value::String(v) => Box::new(v.clone()),
                    Value::Bytes(v) => Box::new(v.clone()),
                    Value::Uuid(v) => Box::new(*v),
                    Value::Date(v) => Box::new(*v),
                    Value::Time(v) => Box::new(*v),
                    Value::DateTime(v) => Box::new(*v),
                    Value::DateTimeUtc(v) => Box::new(*v),
                    Value::Json(v) => Box::new(v.clone()),
                    Value::Array(_) => {
                        return Err(SyncError::Query(
                            "array values are not supported as parameters".to_string(),
                        ));
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgresql"
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let client = self.client.lock().await;
        let boxed = Self::to_sql_params(params)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let affected_rows = client.execute(sql, &refs).await.map_err(|e| {
            SyncError::Query(format!(
                "failed to execute statement: {}",
                format_postgres_error(&e)
            ))
        })?;

        tracing::debug!(affected_rows, "statement executed");
        Ok(StatementResult { affected_rows })
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let client = self.client.lock().await;

        // Prepare first so empty result sets still expose column names.
        let statement = client.prepare(sql).await.map_err(|e| {
            SyncError::Query(format!(
                "failed to prepare query: {}",
                format_postgres_error(&e)
            ))
        })?;

        let boxed = Self::to_sql_params(params)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let pg_rows = client.query(&statement, &refs).await.map_err(|e| {
            SyncError::Query(format!(
                "failed to execute query: {}",
                format_postgres_error(&e)
            ))
        })?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();

        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(postgres_to_value(pg_row, idx));
            }
            rows.push(Row::new(columns.clone(), values));
        }

        tracing::debug!(row_count = rows.len(), "query executed");
        Ok(QueryResult { columns, rows })
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("closing PostgreSQL connection");
        Ok(())
    }
}

/// NUMERIC sign words on the wire
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Decoder for NUMERIC columns: renders the binary wire format as a plain
/// decimal string so values round-trip without float loss.
///
/// The payload is an 8-byte header (digit-group count, weight, sign, display
/// scale) followed by base-10000 digit groups. The value is
/// `sum(group[i] * 10000^(weight - i))`, so after rendering every group as
/// four decimal digits, the decimal point sits after `(weight + 1)` groups.
struct PgNumeric(String);

impl PgNumeric {
    fn parse(raw: &[u8]) -> std::result::Result<String, Box<dyn std::error::Error + Sync + Send>> {
        let header: [u8; 8] = raw
            .get(..8)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or("NUMERIC payload shorter than its header")?;
        let ndigits = u16::from_be_bytes([header[0], header[1]]) as usize;
        let weight = i16::from_be_bytes([header[2], header[3]]) as isize;
        let sign = u16::from_be_bytes([header[4], header[5]]);
        let dscale = u16::from_be_bytes([header[6], header[7]]) as usize;

        match sign {
            NUMERIC_NAN => return Ok("NaN".to_string()),
            NUMERIC_POS | NUMERIC_NEG => {}
            other => return Err(format!("invalid NUMERIC sign word {other:#06x}").into()),
        }

        let body = raw
            .get(8..8 + ndigits * 2)
            .ok_or("NUMERIC payload truncated")?;
        let mut digits = String::with_capacity(ndigits * 4);
        for pair in body.chunks_exact(2) {
            let group = u16::from_be_bytes([pair[0], pair[1]]);
            if group > 9999 {
                return Err(format!("NUMERIC digit group {group} out of range").into());
            }
            digits.push_str(&format!("{group:04}"));
        }
        if digits.is_empty() {
            return Ok("0".to_string());
        }

        let point = (weight + 1) * 4;
        let (integer, mut fraction) = if point <= 0 {
            let pad = "0".repeat(point.unsigned_abs());
            ("0".to_string(), format!("{pad}{digits}"))
        } else if point as usize >= digits.len() {
            let pad = "0".repeat(point as usize - digits.len());
            (format!("{digits}{pad}"), String::new())
        } else {
            let (integer, fraction) = digits.split_at(point as usize);
            (integer.to_string(), fraction.to_string())
        };

        let integer = integer.trim_start_matches('0');
        let integer = if integer.is_empty() { "0" } else { integer };
        fraction.truncate(dscale);
        let fraction = fraction.trim_end_matches('0');

        let minus = if sign == NUMERIC_NEG && (integer != "0" || !fraction.is_empty()) {
            "-"
        } else {
            ""
        };
        if fraction.is_empty() {
            Ok(format!("{minus}{integer}"))
        } else {
            Ok(format!("{minus}{integer}.{fraction}"))
        }
    }
}

impl<'a> tokio_postgres::types::FromSql<'a> for PgNumeric {
    fn from_sql(
        _: &tokio_postgres::types::Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(Self::parse(raw)?))
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        *ty == tokio_postgres::types::Type::NUMERIC
    }
}

/// Fallback decoder for custom types (enums, domains): raw UTF-8 payload.
struct PgText(String);

impl<'a> tokio_postgres::types::FromSql<'a> for PgText {
    fn from_sql(
        _: &tokio_postgres::types::Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(String::from_utf8(raw.to_vec())?))
    }

    fn accepts(_: &tokio_postgres::types::Type) -> bool {
        true
    }
}

/// Convert one PostgreSQL column value to our `Value` type
fn postgres_to_value(row: &PgRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_().name();

    macro_rules! take {
        ($ty:ty, $variant:expr) => {
            row.try_get::<_, Option<$ty>>(idx)
                .ok()
                .flatten()
                .map($variant)
                .unwrap_or(Value::Null)
        };
    }

    match type_name {
        "bool" => take!(bool, Value::Bool),
        "int2" => take!(i16, Value::Int16),
        "int4" => take!(i32, Value::Int32),
        "int8" | "oid" => take!(i64, Value::Int64),
        "float4" => take!(f32, Value::Float32),
        "float8" => take!(f64, Value::Float64),
        "text" | "varchar" | "char" | "bpchar" | "name" => take!(String, Value::String),
        "bytea" => take!(Vec<u8>, Value::Bytes),
        "uuid" => take!(uuid::Uuid, Value::Uuid),
        "json" | "jsonb" => take!(serde_json::Value, Value::Json),
        "date" => take!(chrono::NaiveDate, Value::Date),
        "time" => take!(chrono::NaiveTime, Value::Time),
        "timestamp" => take!(chrono::NaiveDateTime, Value::DateTime),
        "timestamptz" => take!(chrono::DateTime<chrono::Utc>, Value::DateTimeUtc),
        "numeric" => row
            .try_get::<_, Option<PgNumeric>>(idx)
            .ok()
            .flatten()
            .map(|value| Value::Decimal(value.0))
            .unwrap_or(Value::Null),
        "_text" | "_varchar" => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .ok()
            .flatten()
            .map(|arr| Value::Array(arr.into_iter().map(Value::String).collect()))
            .unwrap_or(Value::Null),
        "_int4" => row
            .try_get::<_, Option<Vec<i32>>>(idx)
            .ok()
            .flatten()
            .map(|arr| Value::Array(arr.into_iter().map(Value::Int32).collect()))
            .unwrap_or(Value::Null),
        "_int8" => row
            .try_get::<_, Option<Vec<i64>>>(idx)
            .ok()
            .flatten()
            .map(|arr| Value::Array(arr.into_iter().map(Value::Int64).collect()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<PgText>>(idx)
            .ok()
            .flatten()
            .map(|value| Value::String(value.0))
            .unwrap_or(Value::Null),
    }
}
