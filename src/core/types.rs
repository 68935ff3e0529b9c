use super::{CoordError, Result};
use chrono::Local;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref UNQUOTED_IDENT: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
}

/// Quote an identifier the way the server's `quote_ident` does.
pub fn quote_ident(ident: &str) -> String {
    if UNQUOTED_IDENT.is_match(ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// A lockable relation, unique by oid within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub oid: u32,
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(oid: u32, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            oid,
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Fully-qualified, quoted name.
    pub fn fqn(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fqn())
    }
}

macro_rules! object_types {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Object-type tag attached to every restorable statement.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum ObjectType {
            $($variant),+
        }

        impl ObjectType {
            pub const ALL: &'static [ObjectType] = &[$(ObjectType::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ObjectType::$variant => $tag),+
                }
            }
        }

        impl FromStr for ObjectType {
            type Err = CoordError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($tag => Ok(ObjectType::$variant),)+
                    other => Err(CoordError::ParseError(format!("Unknown object type '{}'", other))),
                }
            }
        }
    };
}

object_types! {
    Aggregate => "AGGREGATE",
    Cast => "CAST",
    Collation => "COLLATION",
    Comment => "COMMENT",
    Constraint => "CONSTRAINT",
    Conversion => "CONVERSION",
    Database => "DATABASE",
    DatabaseGuc => "DATABASE GUC",
    DatabaseMetadata => "DATABASE METADATA",
    Domain => "DOMAIN",
    Extension => "EXTENSION",
    ForeignDataWrapper => "FOREIGN DATA WRAPPER",
    ForeignServer => "FOREIGN SERVER",
    ForeignTable => "FOREIGN TABLE",
    Function => "FUNCTION",
    Index => "INDEX",
    Language => "LANGUAGE",
    MaterializedView => "MATERIALIZED VIEW",
    Operator => "OPERATOR",
    OperatorClass => "OPERATOR CLASS",
    OperatorFamily => "OPERATOR FAMILY",
    Protocol => "PROTOCOL",
    ResourceGroup => "RESOURCE GROUP",
    ResourceQueue => "RESOURCE QUEUE",
    Role => "ROLE",
    Rule => "RULE",
    Schema => "SCHEMA",
    Sequence => "SEQUENCE",
    SequenceOwner => "SEQUENCE OWNER",
    Statistics => "STATISTICS",
    Table => "TABLE",
    Tablespace => "TABLESPACE",
    TextSearchConfiguration => "TEXT SEARCH CONFIGURATION",
    TextSearchDictionary => "TEXT SEARCH DICTIONARY",
    TextSearchParser => "TEXT SEARCH PARSER",
    TextSearchTemplate => "TEXT SEARCH TEMPLATE",
    Trigger => "TRIGGER",
    Type => "TYPE",
    UserMapping => "USER MAPPING",
    View => "VIEW",
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ObjectType {
    type Error = CoordError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectType> for String {
    fn from(value: ObjectType) -> Self {
        value.as_str().to_string()
    }
}

/// Statement filter over object types.
///
/// Include and exclude sets can never be active at the same time; an empty
/// include or exclude list collapses to `NoFilter`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObjectFilter {
    #[default]
    NoFilter,
    Include(BTreeSet<ObjectType>),
    Exclude(BTreeSet<ObjectType>),
}

impl ObjectFilter {
    pub fn include(types: impl IntoIterator<Item = ObjectType>) -> Self {
        let set: BTreeSet<_> = types.into_iter().collect();
        if set.is_empty() {
            ObjectFilter::NoFilter
        } else {
            ObjectFilter::Include(set)
        }
    }

    pub fn exclude(types: impl IntoIterator<Item = ObjectType>) -> Self {
        let set: BTreeSet<_> = types.into_iter().collect();
        if set.is_empty() {
            ObjectFilter::NoFilter
        } else {
            ObjectFilter::Exclude(set)
        }
    }

    /// Build a filter from raw include/exclude lists as they arrive from flags.
    pub fn from_lists<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(CoordError::ConfigError(
                "Include and exclude object-type filters cannot both be set".into(),
            ));
        }
        let parse = |items: &[S]| -> Result<Vec<ObjectType>> {
            items.iter().map(|s| s.as_ref().parse()).collect()
        };
        if !include.is_empty() {
            Ok(Self::include(parse(include)?))
        } else {
            Ok(Self::exclude(parse(exclude)?))
        }
    }

    pub fn matches(&self, object_type: ObjectType) -> bool {
        match self {
            ObjectFilter::NoFilter => true,
            ObjectFilter::Include(set) => set.contains(&object_type),
            ObjectFilter::Exclude(set) => !set.contains(&object_type),
        }
    }
}

/// One restorable statement and the type of object it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementWithType {
    pub object_type: ObjectType,
    pub statement: String,
}

impl StatementWithType {
    pub fn new(object_type: ObjectType, statement: impl Into<String>) -> Self {
        Self {
            object_type,
            statement: statement.into(),
        }
    }
}

/// Ordered list of object identifiers handed to every segment agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidManifest {
    oids: Vec<u32>,
}

impl OidManifest {
    pub fn new(oids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            oids: oids.into_iter().collect(),
        }
    }

    pub fn from_tables(tables: &[TableRef]) -> Self {
        Self::new(tables.iter().map(|t| t.oid))
    }

    /// Parse a manifest rendered one identifier per line.
    pub fn parse(text: &str) -> Result<Self> {
        let oids = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<u32>()
                    .map_err(|_| CoordError::ParseError(format!("Invalid oid '{}' in manifest", l)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { oids })
    }

    pub fn oids(&self) -> &[u32] {
        &self.oids
    }

    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    /// One decimal identifier per line, newline-terminated.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.oids.len() * 8);
        for oid in &self.oids {
            out.push_str(&oid.to_string());
            out.push('\n');
        }
        out
    }
}

/// Identifies one backup or restore invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunFingerprint {
    pub pid: u32,
    pub timestamp: String,
}

impl RunFingerprint {
    pub fn new(pid: u32, timestamp: impl Into<String>) -> Self {
        Self {
            pid,
            timestamp: timestamp.into(),
        }
    }

    /// Fingerprint of the running process, stamped with the local time.
    pub fn current() -> Self {
        Self::new(std::process::id(), current_timestamp())
    }
}

impl fmt::Display for RunFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.timestamp, self.pid)
    }
}

/// `YYYYMMDDHHMMSS` in local time.
pub fn current_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }

    pub fn expansion_message(&self, phase: &ExpansionPhase) -> String {
        match self {
            Operation::Backup => format!(
                "Cluster expansion currently in process ({}), please re-run backup when the expansion has completed",
                phase
            ),
            Operation::Restore => format!(
                "Cluster expansion currently in process ({}). Once expansion is complete, it will be possible to restart restore, but please note existing backup sets taken with a different cluster configuration may no longer be compatible with the newly expanded cluster configuration",
                phase
            ),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which expansion signal was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpansionPhase {
    /// The status marker file exists in the coordinator data directory.
    MarkerFile,
    /// The expansion tracking table reports a redistribution in progress.
    StatusTable,
}

impl fmt::Display for ExpansionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpansionPhase::MarkerFile => f.write_str("phase 1: status file present"),
            ExpansionPhase::StatusTable => f.write_str("phase 2: redistribution in progress"),
        }
    }
}
