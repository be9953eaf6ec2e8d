//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Zi.
//! The Zi project belongs to the Dunimd project team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Session State Machine
//!
//! Observed lifecycle of a plugin session. The complete transition table:
//!
//! | from       | to         | trigger                                             |
//! |------------|------------|-----------------------------------------------------|
//! | `inactive` | `active`   | process spawned / module instantiated               |
//! | `errored`  | `active`   | explicit restart through `start_plugin`             |
//! | `active`   | `inactive` | stop requested by the host and observed             |
//! | `active`   | `errored`  | unrequested exit, pipe failure, protocol violation  |
//!
//! Every other pair is rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ZiError};

/// Runtime-observed state of a plugin session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZiReportedState {
    #[default]
    Inactive,
    Active,
    Errored,
}

impl ZiReportedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZiReportedState::Inactive => "inactive",
            ZiReportedState::Active => "active",
            ZiReportedState::Errored => "errored",
        }
    }

    pub fn can_transition_to(self, next: ZiReportedState) -> bool {
        use ZiReportedState::*;
        matches!(
            (self, next),
            (Inactive, Active) | (Errored, Active) | (Active, Inactive) | (Active, Errored)
        )
    }
}

impl fmt::Display for ZiReportedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted desired activation state of a plugin record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZiActiveState {
    Active,
    #[default]
    Inactive,
}

impl ZiActiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZiActiveState::Active => "active",
            ZiActiveState::Inactive => "inactive",
        }
    }
}

impl fmt::Display for ZiActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZiActiveState {
    type Err = ZiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ZiActiveState::Active),
            "inactive" => Ok(ZiActiveState::Inactive),
            other => Err(ZiError::validation(format!("unknown desired state: '{}'", other))),
        }
    }
}

/// State plus the note recorded on the last transition into `errored`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZiStateReport {
    pub state: ZiReportedState,
    pub error: Option<String>,
}

impl ZiStateReport {
    /// Apply a transition, rejecting pairs outside the table.
    pub(crate) fn transition(&mut self, next: ZiReportedState, note: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ZiError::internal(format!(
                "illegal session transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        self.error = match next {
            ZiReportedState::Errored => note,
            _ => None,
        };
        Ok(())
    }
}
