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

use std::sync::{Once, OnceLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use nodemgmt::node::NodeDate;
use nodemgmt::session::ParentKind;

use crate::utils::db::dump_database;
use crate::utils::model::*;
use crate::utils::EmulatorInstance;


pub(crate) static INIT_LOG: Once = Once::new();

pub(crate) async fn run_script(
    mut script: mpsc::Receiver<TestOp>,
    result_chan: mpsc::Sender<Result<(), AssertionResult>>,
    emulator: &mut EmulatorInstance,
    name: &str,
) -> Result<TestLog, crate::Error> {
    let mut log = vec![];
    let mut result = true;

    while let Some(op) = script.recv().await {
        log::debug!("OP: {:?}", op);

        let fail = match &op {
            TestOp::Action(action) => match emulator.apply(action).await {
                Ok(()) => {
                    emulator.last_error = None;
                    None
                }
                Err(crate::Error::Database(e)) if e.is_fatal() => {
                    Some(AssertionResult::Fatal(e.to_string()))
                }
                Err(crate::Error::Database(e)) => {
                    emulator.log_line(format!("Action failed: {}", e));
                    emulator.last_error = Some(e);
                    None
                }
                Err(e) => return Err(e),
            },
            TestOp::Assertion(assertion) => emulator.check(assertion)?,
        };

        let pass = fail.is_none();
        if let Some(fail) = &fail {
            result_chan.send(Err(fail.clone())).await?;
        } else {
            result_chan.send(Ok(())).await?;
        }

        log.push(TestLogStep {
            op,
            snapshot: dump_database(&mut emulator.ram)?,
            pass,
            fail,
            log_lines: emulator.take_logs(),
        });

        if !pass {
            result = false;
            break;
        }
    }

    Ok(TestLog {
        name: name.to_string(),
        entropy: emulator.entropy,
        result,
        steps: log,
    })
}

pub struct Tester {
    op_sender: mpsc::Sender<TestOp>,
    res_receiver: mpsc::Receiver<Result<(), AssertionResult>>,
    pub rng: StdRng,
}

impl Tester {
    pub fn new(
        op_sender: mpsc::Sender<TestOp>,
        res_receiver: mpsc::Receiver<Result<(), AssertionResult>>,
        entropy: u64,
    ) -> Self {
        Tester {
            op_sender,
            res_receiver,
            rng: StdRng::seed_from_u64(entropy),
        }
    }

    async fn expect_reply(&mut self) -> Result<(), crate::Error> {
        self.res_receiver.recv().await.ok_or("No reply")??;
        Ok(())
    }

    pub async fn action(&mut self, action: TestAction) -> Result<(), crate::Error> {
        self.op_sender.send(action.into()).await?;
        self.expect_reply().await?;

        Ok(())
    }

    pub async fn assertion(&mut self, assertion: TestAssertion) -> Result<(), crate::Error> {
        self.op_sender.send(assertion.into()).await?;
        self.expect_reply().await?;

        Ok(())
    }

    pub async fn format_and_login(&mut self, uid: u8) -> Result<(), crate::Error> {
        self.action(TestAction::FormatUser(uid)).await?;
        self.action(TestAction::Login(uid)).await
    }

    pub async fn set_date(&mut self, year: u16, month: u8, day: u8) -> Result<(), crate::Error> {
        self.action(TestAction::SetDate(NodeDate::new(year, month, day)))
            .await
    }

    pub async fn add_service(&mut self, type_id: usize, service: &str) -> Result<(), crate::Error> {
        self.action(TestAction::AddService {
            kind: ParentKind::Credential,
            type_id,
            service: service.into(),
        })
        .await
    }

    pub async fn add_login(
        &mut self,
        type_id: usize,
        service: &str,
        login: &str,
        password: &str,
    ) -> Result<(), crate::Error> {
        self.action(TestAction::AddLogin {
            type_id,
            service: service.into(),
            login: login.into(),
            password: password.into(),
        })
        .await
    }

    pub async fn services_assertion(
        &mut self,
        kind: ParentKind,
        type_id: usize,
        expected: &[&str],
    ) -> Result<(), crate::Error> {
        self.assertion(TestAssertion::Services {
            kind,
            type_id,
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
        .await
    }

    pub async fn logins_assertion(
        &mut self,
        type_id: usize,
        service: &str,
        expected: &[&str],
    ) -> Result<(), crate::Error> {
        self.assertion(TestAssertion::Logins {
            type_id,
            service: service.into(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        })
        .await
    }

    pub async fn error_assertion(&mut self, expected: Option<nodemgmt::Error>) -> Result<(), crate::Error> {
        self.assertion(TestAssertion::LastError(expected.map(|e| e.to_string())))
            .await
    }
}

pub(crate) fn get_temp_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("REPORT_TMP_DIR") {
        let path = std::path::PathBuf::from(&dir);
        if !path.exists() {
            std::fs::create_dir_all(&path).expect("Can create the report dir");
        }

        path
    } else {
        // n.b. static items do not call [`Drop`] on program termination, so the reports
        // outlive the test run
        static TEMPDIR: OnceLock<tempdir::TempDir> = OnceLock::new();
        TEMPDIR
            .get_or_init(|| {
                tempdir::TempDir::new("nodedb-func-tests").expect("Can create temp directory")
            })
            .path()
            .to_path_buf()
    }
}
