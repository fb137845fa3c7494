// GATT table configuration for the blehost CLI
//
// A table is read from a JSON file shaped like:
//
// {"services":[{"uuid":"180D","characteristics":[
//     {"uuid":"2A37","properties":["read","notify"]}]}]}

use anyhow::{bail, Context, Result};
use blehost_core::att::{CharProps, Uuid};
use blehost_core::gatt::{CharDef, ServiceDef};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GattConfig {
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub characteristics: Vec<CharConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharConfig {
    pub uuid: Uuid,
    #[serde(default)]
    pub properties: Vec<String>,
}

impl CharConfig {
    /// Property names map to flag names case-insensitively ("notify" -> NOTIFY)
    pub fn props(&self) -> Result<CharProps> {
        let mut props = CharProps::empty();
        for name in &self.properties {
            match CharProps::from_name(&name.to_uppercase()) {
                Some(flag) => props |= flag,
                None => bail!("Unknown characteristic property '{}' on {}", name, self.uuid),
            }
        }
        Ok(props)
    }
}

impl GattConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read GATT config {}", path.display()))?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse GATT config")
    }

    /// Characteristic definitions per service, in declaration order
    pub fn char_defs(&self) -> Result<Vec<Vec<CharDef>>> {
        self.services
            .iter()
            .map(|service| {
                service
                    .characteristics
                    .iter()
                    .map(|c| Ok(CharDef::new(c.uuid, c.props()?)))
                    .collect()
            })
            .collect()
    }

    /// Service definitions borrowing from `char_defs`
    pub fn service_defs<'a>(&self, char_defs: &'a [Vec<CharDef>]) -> Vec<ServiceDef<'a>> {
        self.services
            .iter()
            .zip(char_defs)
            .map(|(service, chars)| ServiceDef::new(service.uuid, chars))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEART_RATE: &str = r#"{"services":[{"uuid":"180D","characteristics":[
        {"uuid":"2A37","properties":["read","notify"]},
        {"uuid":"2A39","properties":["write"]}]}]}"#;

    #[test]
    fn test_parse_config() {
        let config = GattConfig::from_json(HEART_RATE).expect("Parse config");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].uuid, Uuid::from16(0x180D));

        let defs = config.char_defs().expect("Char defs");
        assert_eq!(defs[0][0].props, CharProps::READ | CharProps::NOTIFY);
        assert_eq!(defs[0][1].props, CharProps::WRITE);

        let services = config.service_defs(&defs);
        assert_eq!(blehost_core::gatt::attribute_count(&services), 6);
    }

    #[test]
    fn test_unknown_property_rejected() {
        let config = GattConfig::from_json(
            r#"{"services":[{"uuid":"180D","characteristics":[{"uuid":"2A37","properties":["fly"]}]}]}"#,
        )
        .expect("Parse config");
        assert!(config.char_defs().is_err());
    }

    #[test]
    fn test_128bit_service() {
        let config = GattConfig::from_json(
            r#"{"services":[{"uuid":"6e400001-b5a3-f393-e0a9-e50e24dcca9e"}]}"#,
        )
        .expect("Parse config");
        assert!(!config.services[0].uuid.is_16bit());
        assert!(config.services[0].characteristics.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("gatt.json");
        std::fs::write(&path, HEART_RATE).expect("Write config");
        let config = GattConfig::load(&path).expect("Load config");
        assert_eq!(config.services[0].characteristics.len(), 2);

        assert!(GattConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
