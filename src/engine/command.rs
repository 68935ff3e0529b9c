// ============================================================================
// Statement recognition for the in-memory engine
// ============================================================================
//
// The engine understands the handful of statement shapes the coordinator and
// its tests issue. Anything else is rejected with a syntax error.

use crate::core::{CoordError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BEGIN: Regex = Regex::new(r"(?is)^(BEGIN|START\s+TRANSACTION)\b").unwrap();
    static ref COMMIT: Regex = Regex::new(r"(?is)^(COMMIT|END)\b").unwrap();
    static ref ROLLBACK: Regex = Regex::new(r"(?is)^(ROLLBACK|ABORT)\b").unwrap();
    static ref EXPORT_SNAPSHOT: Regex =
        Regex::new(r"(?is)^SELECT\s+(pg_catalog\.)?pg_export_snapshot\(\s*\)$").unwrap();
    static ref IMPORT_SNAPSHOT: Regex =
        Regex::new(r"(?is)^SET\s+TRANSACTION\s+SNAPSHOT\s+'([^']*)'$").unwrap();
    static ref SET_APPLICATION_NAME: Regex =
        Regex::new(r"(?is)^SET\s+application_name\s*(?:TO|=)\s*'([^']*)'$").unwrap();
    static ref SET_OTHER: Regex = Regex::new(r"(?is)^(SET|RESET)\s+").unwrap();
    static ref LOCK: Regex = Regex::new(
        r"(?is)^LOCK\s+(?:TABLE\s+)?(.+?)(?:\s+IN\s+(ACCESS\s+SHARE|ACCESS\s+EXCLUSIVE)\s+MODE)?(\s+NOWAIT)?$"
    )
    .unwrap();
    static ref CREATE_TABLE: Regex = Regex::new(
        r"(?is)^CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(\S+?)\s*\((.*)\)$"
    )
    .unwrap();
    static ref CREATE_SCHEMA: Regex = Regex::new(r"(?is)^CREATE\s+SCHEMA\b").unwrap();
    static ref DROP_TABLE: Regex =
        Regex::new(r"(?is)^DROP\s+TABLE\s+(IF\s+EXISTS\s+)?(\S+?)(\s+CASCADE)?$").unwrap();
    static ref ALTER_TABLE: Regex = Regex::new(r"(?is)^ALTER\s+TABLE\s+(?:ONLY\s+)?(\S+)\s+").unwrap();
    static ref TRUNCATE: Regex = Regex::new(r"(?is)^TRUNCATE\s+(?:TABLE\s+)?(\S+?)$").unwrap();
    static ref INSERT: Regex = Regex::new(
        r"(?is)^INSERT\s+INTO\s+(\S+?)\s*(?:\(([^)]*)\)\s*)?VALUES\s*(.+)$"
    )
    .unwrap();
    static ref UPDATE: Regex =
        Regex::new(r"(?is)^UPDATE\s+(\S+)\s+SET\s+(.+?)(?:\s+WHERE\s+(.+))?$").unwrap();
    static ref DELETE: Regex =
        Regex::new(r"(?is)^DELETE\s+FROM\s+(\S+?)(?:\s+WHERE\s+(.+))?$").unwrap();
    static ref SELECT_FROM: Regex = Regex::new(
        r"(?is)^SELECT\s+(.+?)\s+FROM\s+(\S+?)(?:\s+WHERE\s+(.+?))?(?:\s+ORDER\s+BY\s+(\S+?)(\s+DESC|\s+ASC)?)?(?:\s+LIMIT\s+(\d+))?$"
    )
    .unwrap();
    static ref SLEEP: Regex =
        Regex::new(r"(?is)^SELECT\s+(?:pg_catalog\.)?pg_sleep\(\s*([0-9.]+)\s*\)$").unwrap();
    static ref BACKEND_PID: Regex =
        Regex::new(r"(?is)^SELECT\s+(?:pg_catalog\.)?pg_backend_pid\(\s*\)$").unwrap();
    static ref SELECT_LITERAL: Regex = Regex::new(r"(?is)^SELECT\s+(.+)$").unwrap();
    static ref COPY_PROGRAM: Regex =
        Regex::new(r"(?is)^COPY\s+(\S+).*\s(TO|FROM)\s+PROGRAM\s+'(.*)'").unwrap();
    static ref UTILITY: Regex = Regex::new(r"(?is)^(ANALYZE|VACUUM|COMMENT\s+ON)\b").unwrap();
    static ref AND: Regex = Regex::new(r"(?i)\s+AND\s+").unwrap();
    static ref CONDITION: Regex = Regex::new(
        r"(?is)^\s*(\w+)\s*(=|<>|!=|\s+LIKE\s+)\s*(.+?)\s*$"
    )
    .unwrap();
    static ref TERMINATE: Regex =
        Regex::new(r"(?is)^(?:pg_catalog\.)?pg_terminate_backend\(\s*(\w+)\s*\)$").unwrap();
    static ref NUMBER: Regex = Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    AccessShare,
    AccessExclusive,
}

impl LockMode {
    pub fn conflicts_with(&self, other: LockMode) -> bool {
        matches!(self, LockMode::AccessExclusive) || matches!(other, LockMode::AccessExclusive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(Option<String>),
    BackendPid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Like,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Star,
    CountStar,
    Columns(Vec<String>),
    TerminateBackend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Begin {
        repeatable_read: bool,
    },
    Commit,
    Rollback,
    ExportSnapshot,
    ImportSnapshot(String),
    SetApplicationName(String),
    SetOther,
    Lock {
        tables: Vec<String>,
        mode: LockMode,
        nowait: bool,
    },
    CreateTable {
        table: String,
        columns: Vec<String>,
        if_not_exists: bool,
    },
    CreateSchema,
    DropTable {
        table: String,
        if_exists: bool,
    },
    AlterTable {
        table: String,
    },
    Truncate {
        table: String,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Option<String>>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Option<String>)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
    Select {
        projection: Projection,
        table: String,
        filter: Vec<Condition>,
        order_by: Option<(String, bool)>,
        limit: Option<usize>,
    },
    SelectLiteral(Vec<Option<String>>),
    Sleep(f64),
    BackendPid,
    CopyProgram {
        table: String,
        program: String,
    },
    Utility,
}

fn syntax_error(sql: &str) -> CoordError {
    CoordError::ExecutionError(format!("syntax error at or near \"{}\"", first_word(sql)))
}

fn first_word(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("")
}

/// Split a query string into statements on `;` outside of quotes.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for c in sql.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

/// Split on commas that are outside quotes and parentheses.
fn split_list(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;

    for c in text.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth -= 1,
            ',' if depth == 0 && !in_single && !in_double => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Normalize a relation name to `schema.name`, unquoting identifiers.
pub fn normalize_relation(name: &str) -> String {
    let parts: Vec<String> = split_qualified(name)
        .into_iter()
        .map(|p| unquote_ident(&p))
        .collect();
    match parts.as_slice() {
        [table] => format!("public.{}", table),
        [schema, table] => format!("{}.{}", schema, table),
        _ => parts.join("."),
    }
}

fn split_qualified(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in name.trim().chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            '.' if !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unquote_ident(ident: &str) -> String {
    let ident = ident.trim();
    if ident.len() >= 2 && ident.starts_with('"') && ident.ends_with('"') {
        ident[1..ident.len() - 1].replace("\"\"", "\"")
    } else {
        ident.to_lowercase()
    }
}

/// Parse a literal: quoted string, number, boolean or NULL.
pub fn parse_literal(text: &str) -> Result<Option<String>> {
    let text = text.trim();
    let text = text.split("::").next().unwrap_or(text).trim();
    if text.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Ok(Some(text[1..text.len() - 1].replace("''", "'")));
    }
    if NUMBER.is_match(text) {
        return Ok(Some(text.to_string()));
    }
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        return Ok(Some(text[..1].to_lowercase()));
    }
    Err(CoordError::ExecutionError(format!(
        "unsupported expression \"{}\"",
        text
    )))
}

fn parse_conditions(text: Option<&str>) -> Result<Vec<Condition>> {
    let Some(text) = text else {
        return Ok(Vec::new());
    };
    AND.split(text.trim())
        .map(|part| {
            let caps = CONDITION.captures(part).ok_or_else(|| {
                CoordError::ExecutionError(format!("unsupported condition \"{}\"", part.trim()))
            })?;
            let op = match caps[2].trim().to_uppercase().as_str() {
                "=" => CompareOp::Eq,
                "<>" | "!=" => CompareOp::NotEq,
                _ => CompareOp::Like,
            };
            let rhs = caps[3].trim();
            let operand = if rhs.to_lowercase().trim_start_matches("pg_catalog.") == "pg_backend_pid()" {
                Operand::BackendPid
            } else {
                Operand::Literal(parse_literal(rhs)?)
            };
            Ok(Condition {
                column: caps[1].to_lowercase(),
                op,
                operand,
            })
        })
        .collect()
}

fn parse_projection(text: &str) -> Projection {
    let text = text.trim();
    if text == "*" {
        return Projection::Star;
    }
    if text.to_lowercase().replace(' ', "") == "count(*)" {
        return Projection::CountStar;
    }
    if let Some(caps) = TERMINATE.captures(text) {
        return Projection::TerminateBackend(caps[1].to_lowercase());
    }
    Projection::Columns(
        split_list(text)
            .into_iter()
            .map(|item| {
                // Drop `AS alias`; the engine reports source column names.
                let column = item.split_whitespace().next().unwrap_or("").to_string();
                unquote_ident(&column)
            })
            .collect(),
    )
}

fn parse_insert_rows(values: &str) -> Result<Vec<Vec<Option<String>>>> {
    split_list(values)
        .into_iter()
        .map(|tuple| {
            let inner = tuple
                .trim()
                .strip_prefix('(')
                .and_then(|t| t.strip_suffix(')'))
                .ok_or_else(|| CoordError::ExecutionError("malformed VALUES list".into()))?;
            split_list(inner).iter().map(|v| parse_literal(v)).collect()
        })
        .collect()
}

/// Recognize one statement.
pub fn parse(sql: &str) -> Result<Command> {
    let sql = sql.trim();

    if BEGIN.is_match(sql) {
        let upper = sql.to_uppercase();
        return Ok(Command::Begin {
            repeatable_read: upper.contains("REPEATABLE READ") || upper.contains("SERIALIZABLE"),
        });
    }
    if COMMIT.is_match(sql) {
        return Ok(Command::Commit);
    }
    if ROLLBACK.is_match(sql) {
        return Ok(Command::Rollback);
    }
    if EXPORT_SNAPSHOT.is_match(sql) {
        return Ok(Command::ExportSnapshot);
    }
    if let Some(caps) = IMPORT_SNAPSHOT.captures(sql) {
        return Ok(Command::ImportSnapshot(caps[1].to_string()));
    }
    if let Some(caps) = SET_APPLICATION_NAME.captures(sql) {
        return Ok(Command::SetApplicationName(caps[1].to_string()));
    }
    if SET_OTHER.is_match(sql) {
        return Ok(Command::SetOther);
    }
    if let Some(caps) = LOCK.captures(sql) {
        let mode = match caps.get(2).map(|m| m.as_str().to_uppercase()) {
            Some(m) if m.contains("SHARE") => LockMode::AccessShare,
            // LOCK TABLE without a mode takes ACCESS EXCLUSIVE.
            _ => LockMode::AccessExclusive,
        };
        return Ok(Command::Lock {
            tables: split_list(&caps[1]).iter().map(|t| normalize_relation(t)).collect(),
            mode,
            nowait: caps.get(3).is_some(),
        });
    }
    if let Some(caps) = CREATE_TABLE.captures(sql) {
        let columns = split_list(&caps[3])
            .into_iter()
            .filter_map(|def| def.split_whitespace().next().map(unquote_ident))
            .filter(|c| !matches!(c.as_str(), "constraint" | "primary" | "unique" | "foreign" | "check"))
            .collect();
        return Ok(Command::CreateTable {
            table: normalize_relation(&caps[2]),
            columns,
            if_not_exists: caps.get(1).is_some(),
        });
    }
    if CREATE_SCHEMA.is_match(sql) {
        return Ok(Command::CreateSchema);
    }
    if let Some(caps) = DROP_TABLE.captures(sql) {
        return Ok(Command::DropTable {
            table: normalize_relation(&caps[2]),
            if_exists: caps.get(1).is_some(),
        });
    }
    if let Some(caps) = ALTER_TABLE.captures(sql) {
        return Ok(Command::AlterTable {
            table: normalize_relation(&caps[1]),
        });
    }
    if let Some(caps) = TRUNCATE.captures(sql) {
        return Ok(Command::Truncate {
            table: normalize_relation(&caps[1]),
        });
    }
    if let Some(caps) = INSERT.captures(sql) {
        let columns = caps
            .get(2)
            .map(|m| split_list(m.as_str()).iter().map(|c| unquote_ident(c)).collect());
        return Ok(Command::Insert {
            table: normalize_relation(&caps[1]),
            columns,
            rows: parse_insert_rows(&caps[3])?,
        });
    }
    if let Some(caps) = UPDATE.captures(sql) {
        let assignments = split_list(&caps[2])
            .into_iter()
            .map(|a| {
                let (column, value) = a
                    .split_once('=')
                    .ok_or_else(|| CoordError::ExecutionError(format!("malformed SET \"{}\"", a)))?;
                Ok((unquote_ident(column), parse_literal(value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Command::Update {
            table: normalize_relation(&caps[1]),
            assignments,
            filter: parse_conditions(caps.get(3).map(|m| m.as_str()))?,
        });
    }
    if let Some(caps) = DELETE.captures(sql) {
        return Ok(Command::Delete {
            table: normalize_relation(&caps[1]),
            filter: parse_conditions(caps.get(2).map(|m| m.as_str()))?,
        });
    }
    if let Some(caps) = SLEEP.captures(sql) {
        let secs: f64 = caps[1]
            .parse()
            .map_err(|_| CoordError::ExecutionError("invalid sleep duration".into()))?;
        return Ok(Command::Sleep(secs));
    }
    if BACKEND_PID.is_match(sql) {
        return Ok(Command::BackendPid);
    }
    if let Some(caps) = SELECT_FROM.captures(sql) {
        let order_by = caps.get(4).map(|m| {
            let desc = caps
                .get(5)
                .map(|d| d.as_str().trim().eq_ignore_ascii_case("DESC"))
                .unwrap_or(false);
            (unquote_ident(m.as_str()), desc)
        });
        return Ok(Command::Select {
            projection: parse_projection(&caps[1]),
            table: normalize_relation(&caps[2]),
            filter: parse_conditions(caps.get(3).map(|m| m.as_str()))?,
            order_by,
            limit: caps.get(6).and_then(|m| m.as_str().parse().ok()),
        });
    }
    if let Some(caps) = SELECT_LITERAL.captures(sql) {
        let values = split_list(&caps[1])
            .iter()
            .map(|v| parse_literal(v))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Command::SelectLiteral(values));
    }
    if let Some(caps) = COPY_PROGRAM.captures(sql) {
        return Ok(Command::CopyProgram {
            table: normalize_relation(&caps[1]),
            program: caps[3].to_string(),
        });
    }
    if UTILITY.is_match(sql) {
        return Ok(Command::Utility);
    }

    Err(syntax_error(sql))
}

/// Translate a SQL LIKE pattern into an anchored regex.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| CoordError::ExecutionError(format!("invalid LIKE pattern: {}", e)))
}
