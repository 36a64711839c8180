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

use std::path::PathBuf;

use nodemgmt::free::count_free_slots;
use nodemgmt::node::NodeDate;
use nodemgmt::profile::{format_profile, UserPreferences};
use nodemgmt::session::{ParentKind, Session};
use nodemgmt::{FlashDriver, Geometry, RamFlash};

pub mod db;
pub mod flash;
pub mod model;
pub mod report;

use self::model::{AssertionResult, TestAction, TestAssertion};

/// An emulated device: the database flash in memory, backed by an image file, and the state of
/// the user interface
pub struct EmulatorInstance {
    pub flash: flash::Flash,
    pub ram: RamFlash,
    pub entropy: u64,
    pub last_error: Option<nodemgmt::Error>,

    user: Option<u8>,
    date: Option<NodeDate>,
    category: u8,
    logs: Vec<String>,
}

impl EmulatorInstance {
    /// Start from an existing image, or from an erased flash of the given geometry
    pub async fn spawn(
        flash_file: Option<(PathBuf, bool)>,
        geometry: Option<Geometry>,
        entropy: u64,
    ) -> Result<Self, crate::Error> {
        let (flash, ram) = match flash_file {
            Some((path, allow_changes)) => {
                let flash = flash::Flash::load_from_file(&path, allow_changes).await?;
                let ram = flash.load(geometry.as_ref()).await?;
                (flash, ram)
            }
            None => {
                let geometry = geometry.unwrap_or(Geometry::DEFAULT);
                let flash = flash::Flash::empty_temp_flash(geometry).await?;
                (flash, RamFlash::new(geometry))
            }
        };

        log::debug!(
            "Emulator started on chip {} with entropy {}",
            ram.geometry().chip,
            entropy
        );

        Ok(EmulatorInstance {
            flash,
            ram,
            entropy,
            last_error: None,
            user: None,
            date: None,
            category: 0,
            logs: Vec::new(),
        })
    }

    pub fn geometry(&self) -> Geometry {
        *self.ram.geometry()
    }

    /// Open a session for the logged in user, with the current date and category applied
    pub fn session(&mut self) -> Result<Session<&mut RamFlash>, crate::Error> {
        let uid = self.user.ok_or("No user logged in")?;
        let date = self.date;
        let category = self.category;

        let mut session = Session::open(&mut self.ram, uid)?;
        if let Some(date) = date {
            session.set_current_date(date);
        }
        session.set_current_category(category)?;

        Ok(session)
    }

    pub fn log_line(&mut self, line: String) {
        log::debug!("{}", line);
        self.logs.push(line);
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }

    pub async fn persist(&self) -> Result<(), crate::Error> {
        self.flash.store(&self.ram).await
    }

    /// Write the image back and load it again, as if the device had been power cycled
    pub async fn reset(&mut self) -> Result<(), crate::Error> {
        self.persist().await?;
        self.ram = self.flash.load(Some(&self.geometry())).await?;
        self.user = None;
        self.date = None;
        self.category = 0;

        self.log_line("Device reset".into());
        Ok(())
    }

    pub async fn apply(&mut self, action: &TestAction) -> Result<(), crate::Error> {
        let line = match action {
            TestAction::FormatUser(uid) => {
                format_profile(&mut self.ram, *uid, &UserPreferences::default())?;
                format!("Formatted user {}", uid)
            }
            TestAction::Login(uid) => {
                nodemgmt::profile::Profile::locate(&self.geometry(), *uid)?;
                self.user = Some(*uid);
                format!("User {} logged in", uid)
            }
            TestAction::Logout => {
                self.user = None;
                "Logged out".to_string()
            }
            TestAction::SetDate(date) => {
                self.date = Some(*date);
                format!("Date set to {:?}", date)
            }
            TestAction::SetCategory(category) => {
                if *category as usize >= nodemgmt::NB_CATEGORIES {
                    return Err(nodemgmt::Error::InvalidIndex.into());
                }
                self.category = *category;
                format!("Category set to {}", category)
            }
            TestAction::AddService {
                kind,
                type_id,
                service,
            } => {
                let addr = db::add_service(&mut self.session()?, *kind, *type_id, service)?;
                format!("{:?} parent {} stored at {}", kind, service, addr)
            }
            TestAction::AddLogin {
                type_id,
                service,
                login,
                password,
            } => {
                let addr = db::add_credential(
                    &mut self.session()?,
                    *type_id,
                    service,
                    login,
                    "",
                    password.as_bytes(),
                )?;
                format!("Login {} stored at {}", login, addr)
            }
            TestAction::DeleteService {
                kind,
                type_id,
                service,
            } => {
                db::delete_service(&mut self.session()?, *kind, *type_id, service)?;
                format!("Deleted {:?} parent {}", kind, service)
            }
            TestAction::DeleteLogin {
                type_id,
                service,
                login,
            } => {
                db::delete_login(&mut self.session()?, *type_id, service, login)?;
                format!("Deleted login {} from {}", login, service)
            }
            TestAction::StoreData {
                type_id,
                name,
                payload,
            } => {
                let addr = db::store_data(&mut self.session()?, *type_id, name, payload)?;
                format!("Stored {} bytes as {} at {}", payload.len(), name, addr)
            }
            TestAction::DeleteUser => {
                self.session()?.delete_current_user()?;
                self.user = None;
                "User deleted".to_string()
            }
            TestAction::Reset => {
                self.reset().await?;
                return Ok(());
            }
        };

        self.log_line(line);
        Ok(())
    }

    pub fn check(&mut self, assertion: &TestAssertion) -> Result<Option<AssertionResult>, crate::Error> {
        let fail = match assertion {
            TestAssertion::Services {
                kind,
                type_id,
                expected,
            } => {
                let names = db::parent_names(&mut self.session()?, *kind, *type_id)?;
                (names != *expected).then(|| AssertionResult::WrongList(names))
            }
            TestAssertion::Logins {
                type_id,
                service,
                expected,
            } => {
                let mut session = self.session()?;
                let names = match db::find_parent(&mut session, ParentKind::Credential, *type_id, service)? {
                    Some(parent) => db::login_names(&mut session, parent)?,
                    None => vec![],
                };
                (names != *expected).then(|| AssertionResult::WrongList(names))
            }
            TestAssertion::Data {
                type_id,
                name,
                expected,
            } => {
                let mut session = self.session()?;
                let payload = match db::find_parent(&mut session, ParentKind::Data, *type_id, name)? {
                    Some(parent) => db::read_data(&mut session, parent)?,
                    None => vec![],
                };
                (payload != *expected).then(|| AssertionResult::WrongData(base64::encode(&payload)))
            }
            TestAssertion::FreeSlots(expected) => {
                let free = count_free_slots(&mut self.ram)?;
                (free != *expected).then(|| AssertionResult::WrongCount(free))
            }
            TestAssertion::LastError(expected) => {
                let actual = self.last_error.map(|e| e.to_string());
                (actual != *expected).then(|| AssertionResult::WrongError(actual))
            }
        };

        Ok(fail)
    }
}
