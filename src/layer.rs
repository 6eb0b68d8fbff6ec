//! Architectural layers and layer sets.
//!
//! Every middleware lives in exactly one of four fixed layers. Layers give
//! coarse ordering: across unrelated middleware, a lower layer always runs
//! first, regardless of priority.

use std::fmt;
use std::str::FromStr;

/// An execution tier. Ordered `Global < Group < Route < Controller`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Layer {
    Global,
    Group,
    Route,
    Controller,
}

impl Layer {
    /// Every layer, in evaluation order.
    pub const ALL: [Layer; 4] = [Self::Global, Self::Group, Self::Route, Self::Controller];

    /// Position in evaluation order, `0..4`.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global     => "global",
            Self::Group      => "group",
            Self::Route      => "route",
            Self::Controller => "controller",
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// Parses a lowercase layer name (e.g. `"route"`).
impl FromStr for Layer {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global"     => Ok(Self::Global),
            "group"      => Ok(Self::Group),
            "route"      => Ok(Self::Route),
            "controller" => Ok(Self::Controller),
            _            => Err(()),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subset of layers requested for one compilation.
///
/// Iteration always yields layers in `Global → Group → Route → Controller`
/// order, whatever order they were added in, so two sets holding the same
/// layers are equal and hash the same.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct LayerSet(u8);

impl LayerSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b1111)
    }

    #[must_use]
    pub fn with(mut self, layer: Layer) -> Self {
        self.insert(layer);
        self
    }

    pub fn insert(&mut self, layer: Layer) {
        self.0 |= layer.bit();
    }

    pub fn contains(self, layer: Layer) -> bool {
        self.0 & layer.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Raw bit pattern, stable across runs. Used for cache keys.
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = Layer> {
        Layer::ALL.into_iter().filter(move |l| self.contains(*l))
    }
}

impl From<Layer> for LayerSet {
    fn from(layer: Layer) -> Self {
        Self::empty().with(layer)
    }
}

impl<const N: usize> From<[Layer; N]> for LayerSet {
    fn from(layers: [Layer; N]) -> Self {
        layers.into_iter().collect()
    }
}

impl FromIterator<Layer> for LayerSet {
    fn from_iter<I: IntoIterator<Item = Layer>>(iter: I) -> Self {
        let mut set = Self::empty();
        for layer in iter {
            set.insert(layer);
        }
        set
    }
}

impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, layer) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(layer.as_str())?;
        }
        f.write_str("]")
    }
}
