//! App list entries.

use crate::protocol::{ControlError, ControlResponse, ResponseRecord};

/// One entry of a host's app list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub id: String,
    pub title: String,
    pub running: bool,
    pub hdr_supported: bool,
}

impl AppDescriptor {
    fn from_record(record: &ResponseRecord) -> Result<Self, ControlError> {
        let id = record
            .field("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ControlError::MalformedResponse("<App> without <ID>".to_string()))?;
        Ok(Self {
            id: id.to_string(),
            title: record.field("AppTitle").unwrap_or_default().to_string(),
            running: record.field("IsRunning") == Some("1"),
            hdr_supported: record.field("IsHdrSupported") == Some("1"),
        })
    }

    /// Parses every `<App>` of an `/applist` reply.
    ///
    /// If `current_game` is non-zero the app with that id is marked running
    /// even when the host's own `IsRunning` flag says otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedResponse`] if an entry has no id.
    pub fn list_from_response(
        resp: &ControlResponse,
        current_game: u32,
    ) -> Result<Vec<Self>, ControlError> {
        let running_id = (current_game != 0).then(|| current_game.to_string());
        resp.records("App")
            .map(|record| {
                let mut app = Self::from_record(record)?;
                if running_id.as_deref() == Some(app.id.as_str()) {
                    app.running = true;
                }
                Ok(app)
            })
            .collect()
    }
}
