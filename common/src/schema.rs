use serde::{Deserialize, Serialize};

use crate::err::{CResult, ReplError};

/// A single column of a replicated table.
///
/// `field_type` keeps the raw declared type text (`int unsigned`,
/// `enum('a','b')`, `Nullable(String)` on the target side), `parameters` the
/// remaining column options (`NOT NULL DEFAULT 0` etc). For enum/set columns
/// `additional_data` carries the parsed label list in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableField {
    pub name: String,
    pub field_type: String,
    pub parameters: String,
    pub additional_data: Option<Vec<String>>,
}

impl TableField {
    pub fn new(name: &str, field_type: &str) -> Self {
        TableField {
            name: name.to_string(),
            field_type: field_type.to_string(),
            parameters: String::new(),
            additional_data: None,
        }
    }
}

/// Flat table structure: an ordered field vector plus primary key names and
/// their positions inside that vector. Two of these are kept per replicated
/// table, one with MySQL types and one with ClickHouse types, and they must
/// stay aligned in field count and order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableStructure {
    pub table_name: String,
    pub fields: Vec<TableField>,
    pub primary_keys: Vec<String>,
    pub primary_key_positions: Vec<usize>,
    pub charset: String,
    pub if_not_exists: bool,
}

impl TableStructure {
    /// Recompute `primary_key_positions` after any field mutation.
    pub fn preprocess(&mut self) -> CResult<()> {
        let mut positions = Vec::with_capacity(self.primary_keys.len());
        for key in &self.primary_keys {
            let pos = self
                .fields
                .iter()
                .position(|f| &f.name == key)
                .ok_or_else(|| {
                    ReplError::ParseError(format!(
                        "primary key column {} not found in table {}",
                        key, self.table_name
                    ))
                })?;
            positions.push(pos);
        }
        self.primary_key_positions = positions;
        Ok(())
    }

    pub fn add_field_first(&mut self, new_field: TableField) -> CResult<()> {
        self.fields.insert(0, new_field);
        self.preprocess()
    }

    pub fn add_field_after(&mut self, new_field: TableField, after: &str) -> CResult<()> {
        let idx = self
            .fields
            .iter()
            .position(|f| f.name == after)
            .ok_or_else(|| ReplError::ParseError(format!("field {} not found", after)))?;
        self.fields.insert(idx + 1, new_field);
        self.preprocess()
    }

    pub fn remove_field(&mut self, field_name: &str) -> CResult<()> {
        let idx = self
            .fields
            .iter()
            .position(|f| f.name == field_name)
            .ok_or_else(|| ReplError::ParseError(format!("field {} not found", field_name)))?;
        self.fields.remove(idx);
        self.preprocess()
    }

    pub fn update_field(&mut self, new_field: TableField) -> CResult<()> {
        let idx = self
            .fields
            .iter()
            .position(|f| f.name == new_field.name)
            .ok_or_else(|| {
                ReplError::ParseError(format!("field {} not found", new_field.name))
            })?;
        self.fields[idx] = new_field;
        Ok(())
    }

    pub fn has_field(&self, field_name: &str) -> bool {
        self.fields.iter().any(|f| f.name == field_name)
    }

    pub fn get_field(&self, field_name: &str) -> Option<&TableField> {
        self.fields.iter().find(|f| f.name == field_name)
    }

    pub fn get_field_mut(&mut self, field_name: &str) -> Option<&mut TableField> {
        self.fields.iter_mut().find(|f| f.name == field_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableStructure {
        let mut structure = TableStructure {
            table_name: "users".to_string(),
            fields: vec![
                TableField::new("id", "int"),
                TableField::new("name", "varchar(255)"),
            ],
            primary_keys: vec!["id".to_string()],
            ..Default::default()
        };
        structure.preprocess().unwrap();
        structure
    }

    #[test]
    fn test_preprocess_positions() {
        let structure = sample();
        assert_eq!(structure.primary_key_positions, vec![0]);
    }

    #[test]
    fn test_add_field_after() {
        let mut structure = sample();
        structure
            .add_field_after(TableField::new("age", "int"), "name")
            .unwrap();
        assert_eq!(structure.fields[2].name, "age");
        assert_eq!(structure.primary_key_positions, vec![0]);
    }

    #[test]
    fn test_add_field_first_shifts_primary_key() {
        let mut structure = sample();
        structure
            .add_field_first(TableField::new("tenant", "int"))
            .unwrap();
        assert_eq!(structure.primary_key_positions, vec![1]);
    }

    #[test]
    fn test_remove_missing_field_fails() {
        let mut structure = sample();
        assert!(structure.remove_field("missing").is_err());
    }
}
