#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::error::Error;

/// A version is a 128-bit integer identifying a version of a command or a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u128);

impl Version {
    pub fn new(version: u128) -> Self {
        Version(version)
    }

    /// Creates a new version from bytes.
    /// Implemented as a BLAKE3 hash of the bytes, the first 16 bytes are used.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hash_obj = blake3::hash(bytes);
        let mut first = [0u8; 16];
        first.copy_from_slice(&hash_obj.as_bytes()[0..16]);
        Version(u128::from_be_bytes(first))
    }

    /// Version as a hex string
    pub fn encode(&self) -> String {
        format!("{:032x}", self.0)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RecipeDependency {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Dependencies of a state: versions of all commands used to produce it
/// and the recipe it was made from (if any).
/// Commands are keyed as `ns-{namespace}/{name}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    #[serde(default)]
    pub recipe: RecipeDependency,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_owned();
        self
    }

    pub fn command_key(ns: &str, name: &str) -> String {
        format!("ns-{}/{}", ns, name)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.recipe.version.is_none()
    }

    /// Register a version of a command.
    /// With `detect_collisions`, a different version already recorded for the same command is an error.
    pub fn add_command_dependency(
        &mut self,
        ns: &str,
        name: &str,
        version: &str,
        detect_collisions: bool,
    ) -> Result<&mut Self, Error> {
        let key = Self::command_key(ns, name);
        if detect_collisions {
            if let Some(old_version) = self.commands.get(&key) {
                if old_version != version {
                    tracing::warn!(command = %key, query = %self.query, %old_version, %version, "command version collision");
                    return Err(Error::version_collision(
                        "command",
                        &key,
                        old_version,
                        version,
                    )
                    .with_query_text(&self.query));
                }
            }
        }
        self.commands.insert(key, version.to_owned());
        Ok(self)
    }

    pub fn add_recipe_dependency(
        &mut self,
        recipe_name: &str,
        version: &str,
        detect_collisions: bool,
    ) -> Result<&mut Self, Error> {
        if detect_collisions {
            if let Some(old_version) = &self.recipe.version {
                if old_version != version {
                    tracing::warn!(recipe = recipe_name, query = %self.query, "recipe version collision");
                    return Err(Error::version_collision(
                        "recipe",
                        recipe_name,
                        old_version,
                        version,
                    )
                    .with_query_text(&self.query));
                }
            }
        }
        self.recipe.name = Some(recipe_name.to_owned());
        self.recipe.version = Some(version.to_owned());
        Ok(self)
    }

    /// Merge all dependencies of other into self, detecting collisions
    pub fn merge(&mut self, other: &Dependencies) -> Result<&mut Self, Error> {
        for (key, version) in other.commands.iter() {
            if let Some(old_version) = self.commands.get(key) {
                if old_version != version {
                    return Err(Error::version_collision("command", key, old_version, version)
                        .with_query_text(&self.query));
                }
            }
            self.commands.insert(key.clone(), version.clone());
        }
        if let (Some(name), Some(version)) = (&other.recipe.name, &other.recipe.version) {
            let (name, version) = (name.clone(), version.clone());
            self.add_recipe_dependency(&name, &version, true)?;
        }
        Ok(self)
    }

    /// Check that the recorded versions agree with another dependency record
    pub fn check_compatible(&self, other: &Dependencies) -> Result<(), Error> {
        for (key, version) in other.commands.iter() {
            if let Some(old_version) = self.commands.get(key) {
                if old_version != version {
                    return Err(Error::version_collision("command", key, old_version, version)
                        .with_query_text(&other.query));
                }
            }
        }
        if let (Some(v1), Some(v2)) = (&self.recipe.version, &other.recipe.version) {
            if v1 != v2 {
                let name = other.recipe.name.clone().unwrap_or_default();
                return Err(Error::version_collision("recipe", &name, v1, v2)
                    .with_query_text(&other.query));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    #[test]
    fn version_from_bytes_is_stable() {
        let v1 = Version::from_bytes(b"hello");
        let v2 = Version::from_bytes(b"hello");
        let v3 = Version::from_bytes(b"hello!");
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert_eq!(v1.encode().len(), 32);
    }

    #[test]
    fn command_collision() -> Result<(), Error> {
        let mut deps = Dependencies::new().with_query("a/b");
        deps.add_command_dependency("root", "a", "v1", true)?;
        deps.add_command_dependency("root", "a", "v1", true)?;
        assert_eq!(deps.commands.get("ns-root/a"), Some(&"v1".to_owned()));
        let err = deps
            .add_command_dependency("root", "a", "v2", true)
            .unwrap_err();
        assert_eq!(err.error_type, ErrorType::VersionCollision);
        deps.add_command_dependency("root", "a", "v2", false)?;
        assert_eq!(deps.commands.get("ns-root/a"), Some(&"v2".to_owned()));
        Ok(())
    }

    #[test]
    fn recipe_collision() -> Result<(), Error> {
        let mut deps = Dependencies::new();
        deps.add_recipe_dependency("r", "md5:1", true)?;
        assert!(deps.add_recipe_dependency("r", "md5:2", true).is_err());
        Ok(())
    }

    #[test]
    fn merge_detects_collision() -> Result<(), Error> {
        let mut d1 = Dependencies::new();
        d1.add_command_dependency("root", "x", "1", true)?;
        let mut d2 = Dependencies::new();
        d2.add_command_dependency("root", "y", "1", true)?;
        d1.merge(&d2)?;
        assert_eq!(d1.commands.len(), 2);
        let mut d3 = Dependencies::new();
        d3.add_command_dependency("root", "x", "2", true)?;
        assert!(d1.merge(&d3).is_err());
        assert!(d1.check_compatible(&d3).is_err());
        assert!(d1.check_compatible(&d2).is_ok());
        Ok(())
    }

    #[test]
    fn serialization_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let deps: Dependencies = serde_json::from_str(r#"{"query":"x"}"#)?;
        assert_eq!(deps.query, "x");
        assert!(deps.is_empty());
        Ok(())
    }
}
