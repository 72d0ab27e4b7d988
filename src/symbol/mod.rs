//==================================================
// File: symbol/mod.rs
//==================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Cheap, shareable identifier handles
// Objective: Provide the Symbol type used by tokens, AST, compiler and VM
//==================================================

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reference-counted identifier. Cloning is a pointer copy, which matters
/// because optimizer passes clone whole trees.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compiler-generated names start with a double underscore and can never
    /// be written by hand in any syntax level.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with("__")
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol(Arc::from(value))
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0.to_string()
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Symbol::from(text))
    }
}

/// Hands out fresh compiler-generated names (`__cse0`, `__repeat3`, ...).
#[derive(Debug, Default, Clone)]
pub struct SymbolGenerator {
    next: u32,
}

impl SymbolGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, prefix: &str) -> Symbol {
        let name = format!("__{prefix}{}", self.next);
        self.next += 1;
        Symbol::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn symbols_compare_by_content() {
        let a = Symbol::from("total");
        let b = Symbol::from(String::from("total"));
        assert_eq!(a, b);
        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get("total"), Some(&1));
    }

    #[test]
    fn generated_names_are_synthetic_and_unique() {
        let mut generator = SymbolGenerator::new();
        let first = generator.fresh("cse");
        let second = generator.fresh("cse");
        assert_ne!(first, second);
        assert!(first.is_synthetic());
        assert!(!Symbol::from("user_name").is_synthetic());
    }
}

//==================================================
// End of file
//==================================================
