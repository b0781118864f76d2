//! Component classification.
//!
//! A [`Kind`] decides which aggregate operations a component takes part in:
//!
//! | Kind | `read()` | `read_configuration()` | `hints` |
//! |------|----------|------------------------|---------|
//! | `OMITTED` | – | – | – |
//! | `NORMAL` | yes | – | – |
//! | `CONFIG` | – | yes | – |
//! | `HINTED` | yes | – | yes |
//!
//! `HINTED` contains `NORMAL`: a hinted component is always read. Devices
//! default to `NORMAL | CONFIG` so that both their data and configuration
//! children are reachable from the parent.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Classification of a signal or device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Kind: u8 {
        /// Included in `read()` / `describe()`.
        const NORMAL = 0b001;
        /// Included in `read_configuration()` / `describe_configuration()`.
        const CONFIG = 0b010;
        /// Included in `read()` and reported in `hints`.
        const HINTED = 0b101;
    }
}

impl Kind {
    /// Excluded from every aggregate.
    pub const OMITTED: Kind = Kind::empty();

    /// Whether the component contributes to `read()`.
    pub fn is_read(self) -> bool {
        self.intersects(Kind::NORMAL)
    }

    /// Whether the component contributes to `read_configuration()`.
    pub fn is_config(self) -> bool {
        self.contains(Kind::CONFIG)
    }

    /// Whether the component is reported in `hints`.
    pub fn is_hinted(self) -> bool {
        self.contains(Kind::HINTED)
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::NORMAL
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "omitted");
        }
        let mut parts = Vec::new();
        if self.is_hinted() {
            parts.push("hinted");
        } else if self.is_read() {
            parts.push("normal");
        }
        if self.is_config() {
            parts.push("config");
        }
        write!(f, "{}", parts.join("|"))
    }
}
