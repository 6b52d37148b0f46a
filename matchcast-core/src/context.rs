use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to read match context {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse match context {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    #[serde(deserialize_with = "jersey_from_any")]
    pub jersey: String,
    pub name: String,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Team {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shirt_color: Option<String>,
    #[serde(default)]
    pub players: Vec<Player>,
}

/// Team sheets for the match being narrated, keyed by `home` / `away`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    #[serde(default)]
    pub teams: BTreeMap<String, Team>,
}

impl MatchContext {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        serde_json::from_str(&raw).map_err(|source| ContextError::Parse {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.teams.values().all(|team| team.name.trim().is_empty())
    }

    /// Renders the team sheets as a prompt preamble. Returns `None` when no
    /// team is named.
    pub fn format_for_prompt(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut lines = vec![
            "MATCH CONTEXT (Use player names instead of jersey numbers):".to_string(),
            String::new(),
        ];
        for (key, label) in [("home", "HOME TEAM"), ("away", "AWAY TEAM")] {
            let Some(team) = self.teams.get(key) else {
                continue;
            };
            if team.name.trim().is_empty() {
                continue;
            }
            let mut header = format!("{label}: {}", team.name);
            if let Some(color) = &team.shirt_color {
                header.push_str(&format!(" (wearing {color})"));
            }
            lines.push(header);
            if !team.players.is_empty() {
                lines.push("Players:".to_string());
                for player in &team.players {
                    let mut line = format!("  - #{}: {}", player.jersey, player.name);
                    if let Some(position) = &player.position {
                        line.push_str(&format!(" ({position})"));
                    }
                    if let Some(notes) = &player.notes {
                        line.push_str(&format!(" - {notes}"));
                    }
                    lines.push(line);
                }
            }
            lines.push(String::new());
        }
        lines.push(
            "IMPORTANT: When you see a player wearing jersey #X, use their actual name from the list above."
                .to_string(),
        );
        lines.push(String::new());
        Some(lines.join("\n"))
    }
}

fn jersey_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Jersey {
        Number(u64),
        Text(String),
    }

    Ok(match Jersey::deserialize(deserializer)? {
        Jersey::Number(value) => value.to_string(),
        Jersey::Text(value) => value,
    })
}
