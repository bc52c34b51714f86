//! Preference schema declared by extensions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One preference entry as shown in the host's settings page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceGroup {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    #[serde(flatten)]
    pub kind: PreferenceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PreferenceKind {
    CheckboxGroup {
        items: Vec<CheckboxItem>,
    },
    EditText {
        #[serde(rename = "inputType", default, skip_serializing_if = "Option::is_none")]
        input_type: Option<String>,
        #[serde(default)]
        default: Value,
    },
    FilePicker {
        #[serde(default)]
        default: String,
    },
    DirectoryGroup {
        #[serde(default)]
        default: Vec<PathGroup>,
    },
    ButtonGroup {
        items: Vec<ButtonItem>,
    },
    ProgressBar {
        #[serde(default)]
        default: f64,
    },
    TextField {
        #[serde(default)]
        default: String,
    },
    InfoField {
        #[serde(default)]
        default: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxItem {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathGroup {
    pub path: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonItem {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub last_clicked: i64,
}

/// Parse a preference list as returned by an extension.
///
/// `null` and a missing value both mean "no preferences".
pub fn parse_preferences(value: Value) -> Result<Vec<PreferenceGroup>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value)
}
