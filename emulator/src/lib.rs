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

use std::fmt;

use nodemgmt::image::ImageError;

pub mod utils;

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Database(nodemgmt::Error),
    Image(ImageError),
    Json(serde_json::Error),
    Template(handlebars::TemplateError),
    Render(handlebars::RenderError),
    Assertion(utils::model::AssertionResult),
    Message(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
impl From<nodemgmt::Error> for Error {
    fn from(e: nodemgmt::Error) -> Self {
        Error::Database(e)
    }
}
impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Error::Image(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}
impl From<handlebars::TemplateError> for Error {
    fn from(e: handlebars::TemplateError) -> Self {
        Error::Template(e)
    }
}
impl From<handlebars::RenderError> for Error {
    fn from(e: handlebars::RenderError) -> Self {
        Error::Render(e)
    }
}
impl From<utils::model::AssertionResult> for Error {
    fn from(e: utils::model::AssertionResult) -> Self {
        Error::Assertion(e)
    }
}
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Message("Channel closed".into())
    }
}
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Message(format!("Task failed: {}", e))
    }
}
impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Message(e)
    }
}
impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Message(e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Image(e) => write!(f, "Image error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Template(e) => write!(f, "Template error: {}", e),
            Error::Render(e) => write!(f, "Render error: {}", e),
            Error::Assertion(e) => write!(f, "Assertion failed: {}", e),
            Error::Message(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {}
