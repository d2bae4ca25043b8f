use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::HavenAuthSource;
use crate::engine::EngagementError;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::{TenantManager, TenantStore};

pub struct HavenHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HavenQueryParser>,
}

impl HavenHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HavenQueryParser),
        }
    }

    fn resolve_store<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<TenantStore>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// The login user name is the authenticated email.
    fn session_email<C: ClientInfo>(client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| user_error("28000", "no authenticated user on this session".into()))
    }

    fn session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<TenantStore>, String)> {
        Ok((self.resolve_store(client)?, Self::session_email(client)?))
    }

    async fn run(&self, store: &TenantStore, email: &str, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(store, email, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(
    store: &TenantStore,
    email: &str,
    cmd: Command,
) -> PgWireResult<Response> {
    match cmd {
        Command::RegisterUser { name, image } => {
            let registration = store
                .register_user(email, name, image)
                .await
                .map_err(engagement_err)?;
            let rows = if registration.is_created() { 1 } else { 0 };
            Ok(Response::Execution(Tag::new("INSERT").with_rows(rows)))
        }
        Command::SelectUser => {
            let user = store.get_user(email).await.map_err(engagement_err)?;
            let schema = Arc::new(user_schema());
            let row = encode_user(&schema, &user);
            Ok(query_response(schema, vec![row]))
        }
        Command::InsertBooking { residency_id, date } => {
            store
                .book_visit(email, &residency_id, date)
                .await
                .map_err(engagement_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::SelectBookings => {
            let bookings = store.list_bookings(email).await.map_err(engagement_err)?;
            let schema = Arc::new(bookings_schema());
            let rows: Vec<PgWireResult<DataRow>> = bookings
                .iter()
                .map(|b| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&b.residency_id)?;
                    encoder.encode_field(&b.date)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::DeleteBooking { residency_id } => {
            store
                .cancel_booking(email, &residency_id)
                .await
                .map_err(engagement_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::ToggleFavorite { residency_id } => {
            let (action, user) = store
                .toggle_favorite(email, &residency_id)
                .await
                .map_err(engagement_err)?;
            let schema = Arc::new(toggle_schema());
            let row = encode_toggle(&schema, action, &user);
            Ok(query_response(schema, vec![row]))
        }
        Command::SelectFavorites => {
            let favorites = store.list_favorites(email).await.map_err(engagement_err)?;
            let schema = Arc::new(favorites_schema());
            let rows: Vec<PgWireResult<DataRow>> = favorites
                .iter()
                .map(|rid| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(rid)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_user(schema: &Arc<Vec<FieldInfo>>, user: &User) -> PgWireResult<DataRow> {
    let bookings = serde_json::to_string(&user.booked_visits)
        .map_err(|e| user_error("XX000", e.to_string()))?;
    let favorites = serde_json::to_string(&user.fav_residencies_id)
        .map_err(|e| user_error("XX000", e.to_string()))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&user.id.to_string())?;
    encoder.encode_field(&user.email)?;
    encoder.encode_field(&user.name)?;
    encoder.encode_field(&user.image)?;
    encoder.encode_field(&bookings)?;
    encoder.encode_field(&favorites)?;
    Ok(encoder.take_row())
}

fn encode_toggle(
    schema: &Arc<Vec<FieldInfo>>,
    action: ToggleAction,
    user: &User,
) -> PgWireResult<DataRow> {
    let user_json = user_to_json(user)?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&action.as_str())?;
    encoder.encode_field(&user_json)?;
    Ok(encoder.take_row())
}

fn user_to_json(user: &User) -> PgWireResult<String> {
    serde_json::to_string(&serde_json::json!({
        "id": user.id.to_string(),
        "email": user.email,
        "name": user.name,
        "image": user.image,
        "bookedVisits": user.booked_visits,
        "favResidenciesID": user.fav_residencies_id,
    }))
    .map_err(|e| user_error("XX000", e.to_string()))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("image", Type::VARCHAR),
        text_field("booked_visits", Type::VARCHAR),
        text_field("fav_residencies_id", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("residency_id", Type::VARCHAR),
        text_field("date", Type::INT8),
    ]
}

fn favorites_schema() -> Vec<FieldInfo> {
    vec![text_field("residency_id", Type::VARCHAR)]
}

fn toggle_schema() -> Vec<FieldInfo> {
    vec![
        text_field("action", Type::VARCHAR),
        text_field("user", Type::VARCHAR),
    ]
}

/// Result columns of a statement, judged from its text. Used to describe
/// prepared statements before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("TOGGLE_FAVORITE") {
        toggle_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("FAVORITES") {
        favorites_schema()
    } else if upper.contains("USERS") {
        user_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for HavenHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (store, email) = self.session(client)?;
        Ok(vec![self.run(&store, &email, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HavenQueryParser;

#[async_trait]
impl QueryParser for HavenQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HavenHandler {
    type Statement = String;
    type QueryParser = HavenQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (store, email) = self.session(client)?;
        let sql = substitute_params(portal);
        self.run(&store, &email, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// One `$N` placeholder outside string literals.
struct Placeholder {
    start: usize,
    end: usize,
    index: usize,
}

/// Placeholders in statement order. Text inside `'...'` literals (with `''`
/// escapes) is skipped.
fn placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(index) = sql[start + 1..i].parse::<usize>() {
                    found.push(Placeholder { start, end: i, index });
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|p| p.index).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in a single left to
/// right pass. Inserted values are never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for p in placeholders(sql) {
        let Some(param) = p.index.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..p.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = p.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HavenFactory {
    handler: Arc<HavenHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<HavenAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HavenFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = HavenAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(HavenHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HavenFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = HavenFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engagement failure.
pub fn sqlstate(e: &EngagementError) -> &'static str {
    match e {
        EngagementError::UserNotFound(_) | EngagementError::BookingNotFound(_) => "P0002",
        EngagementError::AlreadyBooked(_) => "23505",
        EngagementError::LimitExceeded(_) => "54000",
        EngagementError::InvalidInput(_) => "22023",
        EngagementError::Storage(_) => "58030",
    }
}

fn engagement_err(e: EngagementError) -> PgWireError {
    if let EngagementError::Storage(inner) = &e {
        tracing::error!("storage failure: {inner}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
