//! Document surface
//!
//! The live document is a list of units (cells). The `Document` trait is what
//! the segmenter and assembler talk to; `Notebook` keeps the units in memory
//! and persists them as a JSON file.

use std::future::Future;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::DocumentSettings;
use crate::str_utils::is_blank;
use crate::types::{CellstreamError, Result, Role, ToolCallResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnitKind {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "markdown")]
    Prose,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Code => "code",
            UnitKind::Prose => "markdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellOutput {
    pub mime: String,
    pub data: String,
}

impl CellOutput {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentUnit {
    pub kind: UnitKind,
    pub language: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_tag: Option<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<CellOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolCallResult>,
}

impl DocumentUnit {
    pub fn new(kind: UnitKind, language: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind,
            language: language.into(),
            content: content.into(),
            role_tag: None,
            diagnostics: Vec::new(),
            outputs: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn prose(content: impl Into<String>) -> Self {
        Self::new(UnitKind::Prose, "markdown", content)
    }

    pub fn code(language: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(UnitKind::Code, language, content)
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role_tag = Some(role);
        self
    }
}

pub trait Document: Send + Sync {
    /// Inserts an empty unit after `after` and returns its index.
    fn insert_unit(
        &self,
        after: usize,
        kind: UnitKind,
        language: &str,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn append_text(&self, index: usize, text: &str) -> impl Future<Output = Result<()>> + Send;

    fn delete_unit(&self, range: Range<usize>) -> impl Future<Output = Result<()>> + Send;

    fn set_unit_role_tag(&self, index: usize, role: Role) -> impl Future<Output = Result<()>> + Send;

    fn unit_text(&self, index: usize) -> impl Future<Output = Result<String>> + Send;

    fn read_units(&self, range: Range<usize>) -> impl Future<Output = Result<Vec<DocumentUnit>>> + Send;

    fn attach_tool_results(
        &self,
        index: usize,
        results: Vec<ToolCallResult>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn unit_count(&self) -> impl Future<Output = usize> + Send;

    fn settings(&self) -> impl Future<Output = DocumentSettings> + Send;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotebookData {
    #[serde(default)]
    pub settings: DocumentSettings,
    #[serde(default)]
    pub units: Vec<DocumentUnit>,
}

pub struct Notebook {
    data: RwLock<NotebookData>,
    path: Option<PathBuf>,
}

fn out_of_range(index: usize, len: usize) -> CellstreamError {
    CellstreamError::Protocol(format!("unit index {} out of range (document has {})", index, len))
}

impl Notebook {
    pub fn new(data: NotebookData) -> Self {
        Self {
            data: RwLock::new(data),
            path: None,
        }
    }

    pub fn from_units(units: Vec<DocumentUnit>) -> Self {
        Self::new(NotebookData {
            settings: DocumentSettings::default(),
            units,
        })
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let data: NotebookData = serde_json::from_str(&raw)?;
        tracing::debug!("[DOCUMENT] Loaded {} units from {}", data.units.len(), path.display());
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path.to_path_buf()),
        })
    }

    pub async fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let serialized = {
            let data = self.data.read().await;
            serde_json::to_string_pretty(&*data)?
        };
        tokio::fs::write(path, serialized).await?;
        tracing::debug!("[DOCUMENT] Saved {}", path.display());
        Ok(())
    }
}

impl Document for Notebook {
    async fn insert_unit(&self, after: usize, kind: UnitKind, language: &str) -> Result<usize> {
        let mut data = self.data.write().await;
        let index = (after + 1).min(data.units.len());
        data.units.insert(index, DocumentUnit::new(kind, language, ""));
        tracing::debug!("[DOCUMENT] Inserted {} unit ({}) at {}", kind.as_str(), language, index);
        Ok(index)
    }

    async fn append_text(&self, index: usize, text: &str) -> Result<()> {
        let mut data = self.data.write().await;
        let len = data.units.len();
        let unit = data.units.get_mut(index).ok_or_else(|| out_of_range(index, len))?;

        let mut text = text;
        if unit.content.is_empty() {
            // No leading whitespace noise in a fresh unit.
            if is_blank(text) {
                return Ok(());
            }
            if let Some(stripped) = text.strip_prefix('\n') {
                text = stripped;
            }
        }
        unit.content.push_str(text);
        Ok(())
    }

    async fn delete_unit(&self, range: Range<usize>) -> Result<()> {
        let mut data = self.data.write().await;
        let len = data.units.len();
        if range.start > range.end || range.end > len {
            return Err(out_of_range(range.end, len).into());
        }
        data.units.drain(range);
        Ok(())
    }

    async fn set_unit_role_tag(&self, index: usize, role: Role) -> Result<()> {
        let mut data = self.data.write().await;
        let len = data.units.len();
        let unit = data.units.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
        unit.role_tag = Some(role);
        Ok(())
    }

    async fn unit_text(&self, index: usize) -> Result<String> {
        let data = self.data.read().await;
        match data.units.get(index) {
            Some(u) => Ok(u.content.clone()),
            None => Err(out_of_range(index, data.units.len()).into()),
        }
    }

    async fn read_units(&self, range: Range<usize>) -> Result<Vec<DocumentUnit>> {
        let data = self.data.read().await;
        let len = data.units.len();
        match data.units.get(range.clone()) {
            Some(units) => Ok(units.to_vec()),
            None => Err(out_of_range(range.end, len).into()),
        }
    }

    async fn attach_tool_results(&self, index: usize, results: Vec<ToolCallResult>) -> Result<()> {
        let mut data = self.data.write().await;
        let len = data.units.len();
        let unit = data.units.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
        unit.tool_results.extend(results);
        Ok(())
    }

    async fn unit_count(&self) -> usize {
        self.data.read().await.units.len()
    }

    async fn settings(&self) -> DocumentSettings {
        self.data.read().await.settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_rules_for_empty_unit() {
        let nb = Notebook::from_units(vec![DocumentUnit::prose("")]);
        nb.append_text(0, "  \n").await.unwrap();
        assert_eq!(nb.unit_text(0).await.unwrap(), "");
        nb.append_text(0, "\nHello").await.unwrap();
        assert_eq!(nb.unit_text(0).await.unwrap(), "Hello");
        nb.append_text(0, "\n world").await.unwrap();
        assert_eq!(nb.unit_text(0).await.unwrap(), "Hello\n world");
    }

    #[tokio::test]
    async fn test_insert_and_delete() {
        let nb = Notebook::from_units(vec![DocumentUnit::prose("q")]);
        let idx = nb.insert_unit(0, UnitKind::Code, "python").await.unwrap();
        assert_eq!(idx, 1);
        nb.set_unit_role_tag(idx, Role::Assistant).await.unwrap();
        let units = nb.read_units(0..2).await.unwrap();
        assert_eq!(units[1].kind, UnitKind::Code);
        assert_eq!(units[1].role_tag, Some(Role::Assistant));
        nb.delete_unit(1..2).await.unwrap();
        assert_eq!(nb.unit_count().await, 1);
        assert!(nb.delete_unit(0..5).await.is_err());
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.json");
        std::fs::write(
            &path,
            r#"{"settings":{"model":"gpt-4","temperature":0.2},"units":[{"kind":"markdown","language":"markdown","content":"hi","role_tag":"user"}]}"#,
        )
        .unwrap();

        let nb = Notebook::open(&path).await.unwrap();
        assert_eq!(nb.settings().await.model.as_deref(), Some("gpt-4"));
        nb.append_text(0, " there").await.unwrap();
        nb.save().await.unwrap();

        let reopened = Notebook::open(&path).await.unwrap();
        assert_eq!(reopened.unit_text(0).await.unwrap(), "hi there");
        assert_eq!(
            reopened.read_units(0..1).await.unwrap()[0].role_tag,
            Some(Role::User)
        );
    }
}
