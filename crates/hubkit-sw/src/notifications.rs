//! Push messages and notification clicks.

use serde::{Deserialize, Serialize};

use crate::clients::Client;
use crate::config::NotificationSettings;

/// Action that opens (or focuses) the site.
pub const ACTION_EXPLORE: &str = "explore";

/// Action that only dismisses the notification.
pub const ACTION_CLOSE: &str = "close";

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: Option<String>,
}

/// Extra data attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// When the push arrived (ms since epoch).
    pub date_of_arrival: i64,
    pub primary_key: u64,
}

/// A notification to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Build the notification for a push message. A missing or blank
    /// payload uses the configured default body.
    pub fn from_push(payload: Option<&str>, settings: &NotificationSettings, now: i64) -> Self {
        let body = payload
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&settings.default_body)
            .to_string();

        Self {
            title: settings.title.clone(),
            body,
            icon: settings.icon.clone(),
            badge: settings.badge.clone(),
            vibrate: settings.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: now,
                primary_key: 1,
            },
            actions: vec![
                NotificationAction {
                    action: ACTION_EXPLORE.to_string(),
                    title: "View details".to_string(),
                    icon: Some("/icons/checkmark.png".to_string()),
                },
                NotificationAction {
                    action: ACTION_CLOSE.to_string(),
                    title: "Close".to_string(),
                    icon: Some("/icons/xmark.png".to_string()),
                },
            ],
        }
    }
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    /// An existing window at the site root was focused.
    Focused(Client),
    /// A new window was opened at the site root.
    Opened(Client),
    /// The notification was dismissed.
    Closed,
}
