//! Loading of configuration structs from TOML files.
//!
//! A config lives in a main directory, and can optionally be tweaked by a file with the same
//! name in an overlay directory. Only the keys present in the overlay are replaced, nested
//! tables are merged recursively.

mod error;


use std::path::Path;

use serde::de::DeserializeOwned;
use toml::{Table, Value};

pub use error::{Error, Result};

/// A configuration struct that is stored as a TOML file.
pub trait Config: DeserializeOwned {
    /// Path of the config file, relative to a config directory.
    const PATH: &'static str;

    /// Load the config from `<root>/<PATH>`.
    fn load(root: impl AsRef<Path>) -> Result<Self> {
        let table = read_table(&root.as_ref().join(Self::PATH))?;
        Self::from_table(table)
    }

    /// Load the config from `<main>/<PATH>`, with `<overlay>/<PATH>` merged on top of it.
    ///
    /// A missing overlay file is not an error, the main config is used as is.
    fn load_with_overlay(main: impl AsRef<Path>, overlay: impl AsRef<Path>) -> Result<Self> {
        let main_table = read_table(&main.as_ref().join(Self::PATH))?;

        let overlay_path = overlay.as_ref().join(Self::PATH);
        if !overlay_path.is_file() {
            tracing::debug!("no overlay for `{}`, using main config", Self::PATH);
            return Self::from_table(main_table);
        }

        let overlay_table = read_table(&overlay_path)?;
        Self::from_table(merge_tables(main_table, overlay_table, true))
    }

    /// Deserialize the config from an already parsed table.
    fn from_table(table: Table) -> Result<Self> {
        Value::Table(table).try_into().map_err(Error::Deserialize)
    }
}

fn read_table(path: &Path) -> Result<Table> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    contents.parse::<Table>().map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge `overlay` on top of `main`.
///
/// Values in the overlay replace the values in main, unless both are tables, in which case
/// they are merged recursively. Keys that only exist in the overlay are added if `add_keys`
/// is set, and dropped otherwise.
#[must_use]
pub fn merge_tables(mut main: Table, overlay: Table, add_keys: bool) -> Table {
    for (key, overlay_value) in overlay {
        match (main.remove(&key), overlay_value) {
            (Some(Value::Table(main_table)), Value::Table(overlay_table)) => {
                let merged = merge_tables(main_table, overlay_table, add_keys);
                main.insert(key, Value::Table(merged));
            }
            (Some(_), overlay_value) => {
                main.insert(key, overlay_value);
            }
            (None, overlay_value) => {
                if add_keys {
                    main.insert(key, overlay_value);
                } else {
                    tracing::warn!("ignoring overlay key `{key}`, it does not exist in main");
                }
            }
        }
    }

    main
}
