// Instrument universe: an explicit symbol file, or discovery from a local price store

use crate::types::Instrument;
use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Price tables are named `<SYMBOL>_5m`
pub const PRICE_TABLE_SUFFIX: &str = "_5m";

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to read instrument file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read price store {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("no trackable instruments found")]
    Empty,
}

/// One symbol per line. Blank lines and `#` comments are skipped; duplicates keep their first position.
pub fn parse_instrument_list(content: &str) -> Vec<Instrument> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Instrument::new)
        .filter(|instrument| seen.insert(instrument.clone()))
        .collect()
}

pub fn load_instrument_file(path: &Path) -> Result<Vec<Instrument>, UniverseError> {
    let content = fs::read_to_string(path).map_err(|source| UniverseError::File {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_instrument_list(&content))
}

/// Symbols with a `<SYMBOL>_5m` table in the store, sorted
pub fn discover_from_price_store(db_path: &Path) -> Result<Vec<Instrument>, UniverseError> {
    let store_error = |source| UniverseError::Store {
        path: db_path.display().to_string(),
        source,
    };

    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(store_error)?;
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ESCAPE '\\'")
        .map_err(store_error)?;
    let pattern = format!("%{}", PRICE_TABLE_SUFFIX.replace('_', "\\_"));
    let names = stmt
        .query_map([pattern], |row| row.get::<_, String>(0))
        .map_err(store_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(store_error)?;

    let symbols: BTreeSet<Instrument> = names
        .iter()
        .filter_map(|name| name.strip_suffix(PRICE_TABLE_SUFFIX))
        .filter(|symbol| !symbol.is_empty())
        .map(Instrument::new)
        .collect();
    Ok(symbols.into_iter().collect())
}

/// The symbol file wins when it exists and lists anything; otherwise the store is scanned.
pub fn resolve_instruments(
    symbols_file: Option<&Path>,
    db_path: Option<&Path>,
) -> Result<Vec<Instrument>, UniverseError> {
    if let Some(path) = symbols_file {
        if path.exists() {
            let instruments = load_instrument_file(path)?;
            if !instruments.is_empty() {
                info!("📋 Loaded {} instruments from {}", instruments.len(), path.display());
                return Ok(instruments);
            }
            warn!("⚠️  Instrument file {} is empty", path.display());
        } else {
            warn!("⚠️  Instrument file {} not found", path.display());
        }
    }

    if let Some(path) = db_path {
        let instruments = discover_from_price_store(path)?;
        if !instruments.is_empty() {
            info!("🔍 Discovered {} instruments in {}", instruments.len(), path.display());
            return Ok(instruments);
        }
    }

    Err(UniverseError::Empty)
}
