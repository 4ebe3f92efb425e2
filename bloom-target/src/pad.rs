use serde::{Deserialize, Serialize};

/// The function of a pad.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadType {
    /// General-purpose I/O.
    Gpio,
    /// Ground.
    Ground,
    /// Supply.
    Power,
    /// Anything else (reset, crystal, ...).
    Other,
}

/// A physical pad on the target die.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pad {
    /// Numeric id, unique within the descriptor.
    pub id: usize,
    /// Stable key (e.g. "pb3").
    pub key: String,
    /// Human-readable name.
    pub name: String,
    #[serde(rename = "type")]
    /// The pad type.
    pub pad_type: PadType,
}

/// The physical form of a pinout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinoutType {
    /// Dual in-line package.
    Dip,
    /// Quad flat package.
    Qfp,
    /// Quad flat no-leads package.
    Qfn,
    /// Ball grid array.
    Bga,
    /// Anything else.
    Other,
}

/// A single pin within a pinout, mapping a position to a pad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    /// Position of the pin within the package (1-based for DIP/QFP).
    pub position: String,
    /// Key of the pad the pin is bonded to, if any.
    pub pad_key: Option<String>,
}

/// A package pinout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pinout {
    /// Stable key, unique within the descriptor.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    #[serde(rename = "type")]
    /// The pinout type.
    pub pinout_type: PinoutType,
    /// The pins of the package.
    pub pins: Vec<Pin>,
}
