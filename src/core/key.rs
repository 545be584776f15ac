//! Binding names, their total order, and the object-id value space.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered binding name.
///
/// `First` sorts below every real name and `Last` above every real name.
/// Real names order lexicographically on their bytes. `First` is a pure
/// comparator sentinel and is never stored in the cache; `Last` is stored
/// exactly once, as the cache's upper sentinel entry.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingKey {
    First,
    Name(String),
    Last,
}

impl BindingKey {
    /// The sentinel below all real names.
    pub const FIRST: BindingKey = BindingKey::First;

    /// The sentinel above all real names.
    pub const LAST: BindingKey = BindingKey::Last;

    pub fn name(name: impl Into<String>) -> Self {
        BindingKey::Name(name.into())
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, BindingKey::Name(_))
    }

    /// The underlying name, if this is not a sentinel.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(name) => Some(name),
            BindingKey::First | BindingKey::Last => None,
        }
    }
}

impl PartialOrd for BindingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BindingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use BindingKey::{First, Last, Name};
        match (self, other) {
            (First, First) | (Last, Last) => Ordering::Equal,
            (First, _) | (_, Last) => Ordering::Less,
            (_, First) | (Last, _) => Ordering::Greater,
            (Name(a), Name(b)) => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

impl fmt::Debug for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::First => f.write_str("<first>"),
            BindingKey::Last => f.write_str("<last>"),
            BindingKey::Name(name) => write!(f, "{name:?}"),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Cow<'_, str> = match self {
            BindingKey::First => Cow::Borrowed("<first>"),
            BindingKey::Last => Cow::Borrowed("<last>"),
            BindingKey::Name(name) => Cow::Borrowed(name),
        };
        f.write_str(&text)
    }
}

/// An opaque 64-bit object identifier.
///
/// Two values are reserved: [`ObjectId::REMOVED`] marks a removed binding
/// and may only appear on a decached entry, and [`ObjectId::LAST_SENTINEL`]
/// is the dummy value carried by the upper sentinel entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// Marks a removed binding.
    pub const REMOVED: ObjectId = ObjectId(-1);

    /// The dummy value of the upper sentinel entry.
    pub const LAST_SENTINEL: ObjectId = ObjectId(-2);

    pub fn is_removed(self) -> bool {
        self == Self::REMOVED
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::REMOVED => f.write_str("oid:<removed>"),
            Self::LAST_SENTINEL => f.write_str("oid:<last>"),
            ObjectId(raw) => write!(f, "oid:{raw}"),
        }
    }
}

/// Whether a name is bound, as claimed by a negative-range update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingState {
    Bound,
    Unbound,
}
