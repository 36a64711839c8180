// nodedb credential database firmware and supporting software libraries
//
// Copyright (C) 2024 Alekos Filini
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use core::fmt;

use serde::{Deserialize, Serialize};

use nodemgmt::node::NodeDate;
use nodemgmt::profile::UserPreferences;
use nodemgmt::session::ParentKind;

pub fn get_entropy(arg: &Option<u64>) -> u64 {
    use rand::RngCore;

    match arg {
        Some(ref val) => *val,
        None => rand::thread_rng().next_u64(),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub enum TestOp {
    Action(TestAction),
    Assertion(TestAssertion),
}

impl From<TestAction> for TestOp {
    fn from(value: TestAction) -> Self {
        TestOp::Action(value)
    }
}
impl From<TestAssertion> for TestOp {
    fn from(value: TestAssertion) -> Self {
        TestOp::Assertion(value)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum TestAction {
    FormatUser(u8),
    Login(u8),
    Logout,
    SetDate(NodeDate),
    SetCategory(u8),
    AddService {
        kind: ParentKind,
        type_id: usize,
        service: String,
    },
    AddLogin {
        type_id: usize,
        service: String,
        login: String,
        password: String,
    },
    DeleteService {
        kind: ParentKind,
        type_id: usize,
        service: String,
    },
    DeleteLogin {
        type_id: usize,
        service: String,
        login: String,
    },
    StoreData {
        type_id: usize,
        name: String,
        payload: Vec<u8>,
    },
    DeleteUser,
    /// Write the flash back to its file and load it again
    Reset,
}

#[derive(Debug, Deserialize, Serialize)]
pub enum TestAssertion {
    Services {
        kind: ParentKind,
        type_id: usize,
        expected: Vec<String>,
    },
    Logins {
        type_id: usize,
        service: String,
        expected: Vec<String>,
    },
    Data {
        type_id: usize,
        name: String,
        expected: Vec<u8>,
    },
    FreeSlots(usize),
    /// Outcome of the previous action, `None` when it succeeded
    LastError(Option<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum AssertionResult {
    WrongList(Vec<String>),
    WrongData(String),
    WrongCount(usize),
    WrongError(Option<String>),
    Fatal(String),
}
impl fmt::Display for AssertionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionResult::WrongList(found) => write!(f, "Found entries {:?}", found),
            AssertionResult::WrongData(found) => write!(f, "Found data (base64) {}", found),
            AssertionResult::WrongCount(found) => write!(f, "Found {} free slots", found),
            AssertionResult::WrongError(None) => write!(f, "Last action succeeded"),
            AssertionResult::WrongError(Some(e)) => write!(f, "Last action failed with: {}", e),
            AssertionResult::Fatal(e) => write!(f, "Fatal database error: {}", e),
        }
    }
}
impl std::error::Error for AssertionResult {}

#[derive(Debug)]
pub struct TestLogStep {
    pub op: TestOp,
    pub snapshot: DatabaseDump,
    pub pass: bool,
    pub fail: Option<AssertionResult>,
    pub log_lines: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TestLog {
    pub name: String,
    pub entropy: u64,
    pub result: bool, // used in the Handlebars template
    pub steps: Vec<TestLogStep>,
}

impl Serialize for TestLogStep {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::{Error, SerializeMap};

        let mut map = serializer.serialize_map(None)?;
        match &self.op {
            TestOp::Assertion(a) => {
                map.serialize_entry("is_assertion", &true)?;
                map.serialize_entry(
                    "assertion",
                    &serde_json::to_string(&a).map_err(S::Error::custom)?,
                )?;
            }
            TestOp::Action(a) => {
                map.serialize_entry("is_action", &true)?;
                map.serialize_entry(
                    "action",
                    &serde_json::to_string(&a).map_err(S::Error::custom)?,
                )?;
            }
        }
        map.serialize_entry(
            "snapshot",
            &serde_json::to_string_pretty(&self.snapshot).map_err(S::Error::custom)?,
        )?;
        map.serialize_entry("pass", &self.pass)?;
        map.serialize_entry("fail", &self.fail.as_ref().map(|f| f.to_string()))?;
        map.serialize_entry("print_log_lines", &!self.log_lines.is_empty())?;
        map.serialize_entry("log_lines", &self.log_lines)?;
        map.end()
    }
}

/// Readable copy of a whole database
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseDump {
    pub chip: String,
    pub page_count: u16,
    pub bytes_per_page: u16,
    pub free_slots: usize,
    pub users: Vec<UserDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDump {
    pub uid: u8,
    pub preferences: UserPreferences,
    pub cred_change_number: u32,
    pub data_change_number: u32,
    pub ctr: String,
    pub category_names: Vec<String>,
    pub favorites: Vec<FavoriteDump>,
    pub credentials: Vec<ServiceDump>,
    pub data: Vec<DataDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FavoriteDump {
    pub category: usize,
    pub slot: usize,
    pub parent: String,
    pub child: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceDump {
    pub type_id: usize,
    pub address: String,
    pub service: String,
    pub last_used: Option<String>,
    pub logins: Vec<LoginDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginDump {
    pub address: String,
    pub login: String,
    pub description: String,
    pub third_field: String,
    pub category: u8,
    pub created: Option<NodeDate>,
    pub last_used: Option<NodeDate>,
    /// Base64 of the stored password blob
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataDump {
    pub type_id: usize,
    pub address: String,
    pub name: String,
    pub ctr: String,
    pub prev_gen: bool,
    pub chunks: usize,
    /// Base64 of the whole payload
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_messages() {
        assert_eq!(
            AssertionResult::WrongList(vec!["a.com".into()]).to_string(),
            "Found entries [\"a.com\"]"
        );
        assert_eq!(AssertionResult::WrongCount(3).to_string(), "Found 3 free slots");
        assert_eq!(
            AssertionResult::WrongError(Some("duplicate key".into())).to_string(),
            "Last action failed with: duplicate key"
        );
        assert_eq!(
            AssertionResult::WrongError(None).to_string(),
            "Last action succeeded"
        );
    }
}
