//! # Pipeline State Machine
//!
//! The server drives every upload through a staged import pipeline and
//! reports each step as a state name. This module names those states,
//! classifies them for display and decides which transitions are legal.
//!
//! ## State Machine
//!
//! ```text
//! (none)              → waitforchunk, uploadfailed
//! waitforchunk        → waitforchunk, uploadcomplete, uploadfailed
//! uploadcomplete      → preprocessing
//! preprocessing       → readyforintegration, invalidcontent
//! readyforintegration → integrating, startartworkimport
//! integrating         → readyforimport, invalidcontent, integrationfailed
//! readyforimport      → startmusicimport, startartworkimport
//! startmusicimport    → importingmusic, importfailed
//! importingmusic      → startartworkimport, importcomplete, importfailed
//! startartworkimport  → importingartwork, importfailed
//! importingartwork    → importcomplete, importfailed
//! any                 → remove, notexisting
//! remove              → notexisting
//! ```
//!
//! Terminal states (`uploadfailed`, `invalidcontent`, `integrationfailed`,
//! `importfailed`, `importcomplete`, `notexisting`) can only be left towards
//! `remove` or `notexisting`. A non-terminal state may be reported again.

use crate::error::{Result, UploadError};
use crate::identity::ContentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Pipeline States
// ============================================================================

/// A pipeline state as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Task reference is invalid or was lost
    NotExisting,
    /// Server is requesting more bytes
    WaitForChunk,
    /// All bytes received
    UploadComplete,
    UploadFailed,
    /// Unpacking and normalizing the upload
    Preprocessing,
    ReadyForIntegration,
    /// Merging into the target tree
    Integrating,
    InvalidContent,
    ReadyForImport,
    IntegrationFailed,
    StartMusicImport,
    ImportingMusic,
    StartArtworkImport,
    ImportingArtwork,
    ImportFailed,
    ImportComplete,
    /// Server-side cleanup in progress
    Remove,
}

impl PipelineState {
    pub const ALL: [PipelineState; 17] = [
        PipelineState::NotExisting,
        PipelineState::WaitForChunk,
        PipelineState::UploadComplete,
        PipelineState::UploadFailed,
        PipelineState::Preprocessing,
        PipelineState::ReadyForIntegration,
        PipelineState::Integrating,
        PipelineState::InvalidContent,
        PipelineState::ReadyForImport,
        PipelineState::IntegrationFailed,
        PipelineState::StartMusicImport,
        PipelineState::ImportingMusic,
        PipelineState::StartArtworkImport,
        PipelineState::ImportingArtwork,
        PipelineState::ImportFailed,
        PipelineState::ImportComplete,
        PipelineState::Remove,
    ];

    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::NotExisting => "notexisting",
            PipelineState::WaitForChunk => "waitforchunk",
            PipelineState::UploadComplete => "uploadcomplete",
            PipelineState::UploadFailed => "uploadfailed",
            PipelineState::Preprocessing => "preprocessing",
            PipelineState::ReadyForIntegration => "readyforintegration",
            PipelineState::Integrating => "integrating",
            PipelineState::InvalidContent => "invalidcontent",
            PipelineState::ReadyForImport => "readyforimport",
            PipelineState::IntegrationFailed => "integrationfailed",
            PipelineState::StartMusicImport => "startmusicimport",
            PipelineState::ImportingMusic => "importingmusic",
            PipelineState::StartArtworkImport => "startartworkimport",
            PipelineState::ImportingArtwork => "importingartwork",
            PipelineState::ImportFailed => "importfailed",
            PipelineState::ImportComplete => "importcomplete",
            PipelineState::Remove => "remove",
        }
    }

    /// Check if this state ends the pipeline
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::UploadFailed
                | PipelineState::InvalidContent
                | PipelineState::IntegrationFailed
                | PipelineState::ImportFailed
                | PipelineState::ImportComplete
                | PipelineState::NotExisting
        )
    }

    /// Whether the task still holds bytes the server may ask for.
    ///
    /// Every other state releases the payload.
    pub fn holds_payload(&self) -> bool {
        matches!(self, PipelineState::WaitForChunk)
    }

    pub fn class(&self) -> StateClass {
        match self {
            PipelineState::UploadComplete
            | PipelineState::ReadyForIntegration
            | PipelineState::ReadyForImport
            | PipelineState::ImportComplete => StateClass::Good,
            PipelineState::NotExisting
            | PipelineState::UploadFailed
            | PipelineState::InvalidContent
            | PipelineState::IntegrationFailed
            | PipelineState::ImportFailed => StateClass::Bad,
            PipelineState::WaitForChunk
            | PipelineState::Preprocessing
            | PipelineState::Integrating
            | PipelineState::StartMusicImport
            | PipelineState::ImportingMusic
            | PipelineState::StartArtworkImport
            | PipelineState::ImportingArtwork
            | PipelineState::Remove => StateClass::Active,
        }
    }

    /// Human readable status line
    pub fn status_text(&self) -> &'static str {
        match self {
            PipelineState::NotExisting => "Internal Chaos",
            PipelineState::WaitForChunk => "Uploading …",
            PipelineState::UploadComplete => "Upload Succeeded",
            PipelineState::UploadFailed => "Upload Failed",
            PipelineState::Preprocessing => "Preprocessing Upload …",
            PipelineState::ReadyForIntegration => "Upload Succeeded",
            PipelineState::Integrating => "Integrating …",
            PipelineState::InvalidContent => "Invalid Content",
            PipelineState::ReadyForImport => "Integration Succeeded",
            PipelineState::IntegrationFailed => "Integration Failed",
            PipelineState::StartMusicImport | PipelineState::ImportingMusic => {
                "Importing Music …"
            }
            PipelineState::StartArtworkImport | PipelineState::ImportingArtwork => {
                "Importing Artwork …"
            }
            PipelineState::ImportFailed => "Import Failed",
            PipelineState::ImportComplete => "Import Succeeded",
            PipelineState::Remove => "Removing Upload",
        }
    }

    /// Display stage the state belongs to, if any
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineState::WaitForChunk
            | PipelineState::UploadComplete
            | PipelineState::UploadFailed => Some(PipelineStage::Uploading),
            PipelineState::Preprocessing
            | PipelineState::ReadyForIntegration
            | PipelineState::InvalidContent => Some(PipelineStage::Preprocess),
            PipelineState::Integrating
            | PipelineState::ReadyForImport
            | PipelineState::IntegrationFailed => Some(PipelineStage::Integrate),
            PipelineState::StartMusicImport | PipelineState::ImportingMusic => {
                Some(PipelineStage::ImportMusic)
            }
            PipelineState::StartArtworkImport
            | PipelineState::ImportingArtwork
            | PipelineState::ImportFailed
            | PipelineState::ImportComplete => Some(PipelineStage::ImportArtwork),
            PipelineState::NotExisting | PipelineState::Remove => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        PipelineState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UploadError::InvalidState(s.to_string()))
    }
}

/// Wire name for an optional state, `"none"` before the server acknowledged the task
pub fn state_name(state: Option<PipelineState>) -> &'static str {
    state.map_or("none", |s| s.as_str())
}

/// Status line for an optional state
pub fn status_line(state: Option<PipelineState>) -> &'static str {
    state.map_or("No upload processing", |s| s.status_text())
}

// ============================================================================
// Display Classes and Stages
// ============================================================================

/// Display class of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateClass {
    Good,
    Bad,
    Active,
    /// No state yet
    Open,
}

impl StateClass {
    pub fn of(state: Option<PipelineState>) -> Self {
        state.map_or(StateClass::Open, |s| s.class())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateClass::Good => "good",
            StateClass::Bad => "bad",
            StateClass::Active => "active",
            StateClass::Open => "open",
        }
    }
}

impl fmt::Display for StateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five stages an upload is displayed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Uploading,
    Preprocess,
    Integrate,
    ImportMusic,
    ImportArtwork,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Uploading,
        PipelineStage::Preprocess,
        PipelineStage::Integrate,
        PipelineStage::ImportMusic,
        PipelineStage::ImportArtwork,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Uploading => "uploading",
            PipelineStage::Preprocess => "preprocess",
            PipelineStage::Integrate => "integrate",
            PipelineStage::ImportMusic => "importmusic",
            PipelineStage::ImportArtwork => "importartwork",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineStage::Uploading => "Uploading selected file",
            PipelineStage::Preprocess => "Preprocessing uploaded file",
            PipelineStage::Integrate => "Integrating upload into the music directory",
            PipelineStage::ImportMusic => "Importing upload into the music database",
            PipelineStage::ImportArtwork => "Generating artwork for the user interface",
        }
    }

    /// Class of every stage for a task currently in `state`.
    ///
    /// Stages before the current one are good, the current one takes the
    /// state's class and later ones are open.
    pub fn progression(state: Option<PipelineState>) -> [(PipelineStage, StateClass); 5] {
        let current = state.and_then(|s| s.stage());
        PipelineStage::ALL.map(|stage| {
            let class = match (current, state) {
                (Some(current), Some(state)) if stage == current => state.class(),
                (Some(current), _) if stage < current => StateClass::Good,
                _ => StateClass::Open,
            };
            (stage, class)
        })
    }
}

// ============================================================================
// Transition Table
// ============================================================================

/// Lookup of legal pipeline transitions. Holds no task data.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStateMachine;

impl PipelineStateMachine {
    /// Check whether `from → to` is legal. `None` is the state of a task
    /// the server has not acknowledged yet.
    pub fn is_legal(from: Option<PipelineState>, to: PipelineState) -> bool {
        use PipelineState::*;

        if matches!(to, NotExisting | Remove) {
            return true;
        }

        let Some(from) = from else {
            return matches!(to, WaitForChunk | UploadFailed);
        };

        if from == to {
            return !from.is_terminal();
        }

        matches!(
            (from, to),
            (WaitForChunk, UploadComplete | UploadFailed)
                | (UploadComplete, Preprocessing)
                | (Preprocessing, ReadyForIntegration | InvalidContent)
                | (ReadyForIntegration, Integrating | StartArtworkImport)
                | (Integrating, ReadyForImport | InvalidContent | IntegrationFailed)
                | (ReadyForImport, StartMusicImport | StartArtworkImport)
                | (StartMusicImport, ImportingMusic | ImportFailed)
                | (ImportingMusic, StartArtworkImport | ImportComplete | ImportFailed)
                | (StartArtworkImport, ImportingArtwork | ImportFailed)
                | (ImportingArtwork, ImportComplete | ImportFailed)
        )
    }

    /// Validate a transition for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::IllegalTransition`] if the table forbids it.
    pub fn validate(
        task_id: &ContentId,
        from: Option<PipelineState>,
        to: PipelineState,
    ) -> Result<()> {
        if Self::is_legal(from, to) {
            return Ok(());
        }

        Err(UploadError::IllegalTransition {
            task_id: task_id.to_string(),
            from: state_name(from).to_string(),
            to: to.as_str().to_string(),
        })
    }

    /// All states reachable from `from` in one step
    pub fn successors(from: Option<PipelineState>) -> Vec<PipelineState> {
        PipelineState::ALL
            .iter()
            .copied()
            .filter(|to| Self::is_legal(from, *to))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::identify;
    use PipelineState::*;

    #[test]
    fn test_wire_names_roundtrip() {
        for state in PipelineState::ALL {
            assert_eq!(state.as_str().parse::<PipelineState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!(matches!(
            "uploading".parse::<PipelineState>(),
            Err(UploadError::InvalidState(_))
        ));
    }

    #[test]
    fn test_happy_path_music_import() {
        let path = [
            WaitForChunk,
            WaitForChunk,
            UploadComplete,
            Preprocessing,
            ReadyForIntegration,
            Integrating,
            ReadyForImport,
            StartMusicImport,
            ImportingMusic,
            StartArtworkImport,
            ImportingArtwork,
            ImportComplete,
        ];

        let mut from = None;
        for to in path {
            assert!(
                PipelineStateMachine::is_legal(from, to),
                "{} -> {} should be legal",
                state_name(from),
                to
            );
            from = Some(to);
        }
    }

    #[test]
    fn test_artwork_shortcut() {
        assert!(PipelineStateMachine::is_legal(
            Some(ReadyForIntegration),
            StartArtworkImport
        ));
    }

    #[test]
    fn test_failure_branches() {
        assert!(PipelineStateMachine::is_legal(None, UploadFailed));
        assert!(PipelineStateMachine::is_legal(Some(WaitForChunk), UploadFailed));
        assert!(PipelineStateMachine::is_legal(Some(Preprocessing), InvalidContent));
        assert!(PipelineStateMachine::is_legal(Some(Integrating), InvalidContent));
        assert!(PipelineStateMachine::is_legal(Some(Integrating), IntegrationFailed));
        assert!(PipelineStateMachine::is_legal(Some(ImportingMusic), ImportFailed));
    }

    #[test]
    fn test_terminal_states_only_leave_to_cleanup() {
        for terminal in PipelineState::ALL.iter().filter(|s| s.is_terminal()) {
            let successors = PipelineStateMachine::successors(Some(*terminal));
            assert_eq!(successors, vec![NotExisting, Remove], "from {}", terminal);
        }
    }

    #[test]
    fn test_remove_only_leads_to_notexisting() {
        assert!(PipelineStateMachine::is_legal(Some(Remove), NotExisting));
        assert!(PipelineStateMachine::is_legal(Some(Remove), Remove));
        assert!(!PipelineStateMachine::is_legal(Some(Remove), WaitForChunk));
    }

    #[test]
    fn test_backwards_and_skipping_rejected() {
        assert!(!PipelineStateMachine::is_legal(Some(UploadComplete), WaitForChunk));
        assert!(!PipelineStateMachine::is_legal(None, UploadComplete));
        assert!(!PipelineStateMachine::is_legal(Some(WaitForChunk), Preprocessing));
        assert!(!PipelineStateMachine::is_legal(Some(ReadyForImport), ImportComplete));
    }

    #[test]
    fn test_validate_reports_states() {
        let id = identify(b"abc");
        let err = PipelineStateMachine::validate(&id, Some(ImportComplete), WaitForChunk)
            .unwrap_err();

        match err {
            UploadError::IllegalTransition { task_id, from, to } => {
                assert_eq!(task_id, id.to_string());
                assert_eq!(from, "importcomplete");
                assert_eq!(to, "waitforchunk");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = PipelineStateMachine::validate(&id, None, Integrating).unwrap_err();
        assert!(err.to_string().contains("from none to integrating"));
    }

    #[test]
    fn test_classes_and_status_text() {
        assert_eq!(NotExisting.class(), StateClass::Bad);
        assert_eq!(NotExisting.status_text(), "Internal Chaos");
        assert_eq!(ReadyForIntegration.class(), StateClass::Good);
        assert_eq!(ReadyForIntegration.status_text(), "Upload Succeeded");
        assert_eq!(ReadyForImport.status_text(), "Integration Succeeded");
        assert_eq!(Remove.class(), StateClass::Active);
        assert_eq!(StateClass::of(None), StateClass::Open);
        assert_eq!(status_line(None), "No upload processing");
        assert_eq!(status_line(Some(ImportingArtwork)), "Importing Artwork …");
    }

    #[test]
    fn test_stage_progression() {
        let stages = PipelineStage::progression(Some(Integrating));
        assert_eq!(stages[0], (PipelineStage::Uploading, StateClass::Good));
        assert_eq!(stages[1], (PipelineStage::Preprocess, StateClass::Good));
        assert_eq!(stages[2], (PipelineStage::Integrate, StateClass::Active));
        assert_eq!(stages[3], (PipelineStage::ImportMusic, StateClass::Open));

        let failed = PipelineStage::progression(Some(InvalidContent));
        assert_eq!(failed[1], (PipelineStage::Preprocess, StateClass::Bad));

        let none = PipelineStage::progression(None);
        assert!(none.iter().all(|(_, class)| *class == StateClass::Open));
    }

    #[test]
    fn test_only_waitforchunk_holds_payload() {
        let holding: Vec<_> = PipelineState::ALL
            .iter()
            .filter(|s| s.holds_payload())
            .collect();
        assert_eq!(holding, vec![&WaitForChunk]);
    }
}
