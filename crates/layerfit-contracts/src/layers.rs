use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Garment category. Each category is a fixed-capacity, index-addressed
/// sequence of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Outer,
    Inner,
    Bottoms,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Outer, Category::Inner, Category::Bottoms];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Outer => "outer",
            Category::Inner => "inner",
            Category::Bottoms => "bottoms",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "outer" => Ok(Category::Outer),
            "inner" => Ok(Category::Inner),
            "bottoms" | "bottom" => Ok(Category::Bottoms),
            other => Err(format!("unknown garment category '{other}'")),
        }
    }
}

/// One addressable slot: a category plus an index within its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotPosition {
    pub category: Category,
    pub index: usize,
}

impl SlotPosition {
    pub const fn new(category: Category, index: usize) -> Self {
        Self { category, index }
    }

    pub fn layer(self) -> Option<u8> {
        layer_index_of(self.category, self.index)
    }

    /// Human name of the layer occupying this slot.
    pub fn layer_name(self) -> &'static str {
        match (self.category, self.index) {
            (Category::Bottoms, 0) => "bottoms layer 1",
            (Category::Bottoms, 1) => "bottoms layer 2",
            (Category::Inner, 2) => "base inner",
            (Category::Inner, 1) => "main top",
            (Category::Inner, 0) => "mid layer",
            (Category::Outer, 1) => "light outer",
            (Category::Outer, 0) => "heavy outer",
            _ => "unknown layer",
        }
    }
}

impl fmt::Display for SlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.category, self.index)
    }
}

pub fn capacity_of(category: Category) -> usize {
    match category {
        Category::Outer => 2,
        Category::Inner => 3,
        Category::Bottoms => 2,
    }
}

/// Draw layer of a slot, innermost (1) to outermost (7). `None` when the
/// index is outside the category's capacity.
pub fn layer_index_of(category: Category, index: usize) -> Option<u8> {
    match (category, index) {
        (Category::Bottoms, 0) => Some(1),
        (Category::Bottoms, 1) => Some(2),
        (Category::Inner, 2) => Some(3),
        (Category::Inner, 1) => Some(4),
        (Category::Inner, 0) => Some(5),
        (Category::Outer, 1) => Some(6),
        (Category::Outer, 0) => Some(7),
        _ => None,
    }
}

const CANONICAL_ORDER: [SlotPosition; 7] = [
    SlotPosition::new(Category::Bottoms, 0),
    SlotPosition::new(Category::Bottoms, 1),
    SlotPosition::new(Category::Inner, 2),
    SlotPosition::new(Category::Inner, 1),
    SlotPosition::new(Category::Inner, 0),
    SlotPosition::new(Category::Outer, 1),
    SlotPosition::new(Category::Outer, 0),
];

/// Every slot in wearing order, ascending by layer index.
pub fn canonical_order() -> &'static [SlotPosition; 7] {
    &CANONICAL_ORDER
}
