use log::{debug, error, info};
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, PRAGMA, USER_AGENT,
};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::eventsocket::EventSocket;
use crate::types::{AccountAppliances, ApplianceData, CommandEnvelope, EventMessage, UserDetails};

const DEFAULT_BASE_URL: &str = "https://api.whrcloud.com";
const DEFAULT_WS_BASE_URL: &str = "wss://ws.whrcloud.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SEND_ATTEMPTS: u32 = 3;

/// Coarse change notification: no payload, one invocation per event
/// message. Consumers re-read the attribute table to see what changed.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

type SharedData = Arc<Mutex<Option<ApplianceData>>>;

/// Retry states for [`Appliance::send_attributes`].
enum SendState {
    Attempt(u32),
    ReauthAndRetry(u32),
    Success,
    Failed,
}

/// One authenticated session against a single appliance.
///
/// Owns the HTTP session (rebuilt on reconnect), the attribute table, and
/// the event socket. The shared [`Auth`] coordinator lives for the user's
/// login and may back several appliances at once.
pub struct Appliance {
    auth: Arc<Auth>,
    said: String,
    base_url: String,
    data: SharedData,
    session: Option<reqwest::Client>,
    event_socket: EventSocket,
}

impl Appliance {
    pub fn new(auth: Arc<Auth>, said: &str, attr_changed: Option<ChangeCallback>) -> Self {
        Self::new_with_base_urls(
            auth,
            said,
            attr_changed,
            DEFAULT_BASE_URL.to_string(),
            DEFAULT_WS_BASE_URL.to_string(),
        )
    }

    // Test-specific constructor for custom base URLs
    pub fn new_with_base_urls(
        auth: Arc<Auth>,
        said: &str,
        attr_changed: Option<ChangeCallback>,
        base_url: String,
        ws_base_url: String,
    ) -> Self {
        let data: SharedData = Arc::new(Mutex::new(None));

        let handler = {
            let data = Arc::clone(&data);
            let attr_changed = attr_changed.clone();
            Arc::new(move |msg: String| {
                Self::apply_event_message(&data, attr_changed.as_ref(), &msg);
            })
        };

        // The socket pins the token in hand right now. A later refresh
        // leaves this subscription on the old token until it is stopped
        // and started again.
        let event_socket = EventSocket::new(
            format!("{}/appliance/websocket/{}", ws_base_url, said),
            auth.get_access_token().unwrap_or_default(),
            handler,
        );

        Self {
            auth,
            said: said.to_string(),
            base_url,
            data,
            session: None,
            event_socket,
        }
    }

    pub fn said(&self) -> &str {
        &self.said
    }

    /// Open the HTTP session, fetch the initial attribute state, and start
    /// the event listener -- in that order.
    pub async fn connect(&mut self) -> Result<()> {
        self.start_http_session()?;
        self.start_event_listener().await?;
        Ok(())
    }

    /// Stop the event listener, then close the HTTP session. Safe to call
    /// on an already-disconnected appliance.
    pub async fn disconnect(&mut self) {
        self.stop_event_listener().await;
        self.stop_http_session();
    }

    /// (Re)build the authenticated HTTP session from the current access
    /// token. Any previous session is closed first.
    pub fn start_http_session(&mut self) -> Result<()> {
        self.stop_http_session();

        let headers = self.create_headers()?;
        let session = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        self.session = Some(session);
        Ok(())
    }

    fn stop_http_session(&mut self) {
        // Dropping the client tears down its connection pool.
        self.session = None;
    }

    async fn start_event_listener(&mut self) -> Result<()> {
        self.fetch_attributes().await?;
        self.event_socket.start();
        Ok(())
    }

    async fn stop_event_listener(&mut self) {
        self.event_socket.stop().await;
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let access_token = self
            .auth
            .get_access_token()
            .ok_or_else(|| Error::Auth("No access token, authenticate first".to_string()))?;

        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", access_token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|e| Error::Other(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("okhttp/3.12.0"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Ok(headers)
    }

    /// Fetch the appliance's full attribute document, replacing the table
    /// wholesale. `Ok(true)` only on HTTP 200; timeouts and other statuses
    /// log and return `Ok(false)`. After a failure the table holds
    /// whatever the last assignment produced, not the pre-fetch contents.
    pub async fn fetch_attributes(&mut self) -> Result<bool> {
        let session = match &self.session {
            Some(session) => session,
            None => {
                error!("Session not started");
                return Ok(false);
            }
        };

        let url = format!("{}/api/v1/appliance/{}", self.base_url, self.said);
        *self.data.lock().unwrap() = None;

        let request = async {
            let response = session.get(&url).send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, response_text) = match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
            Ok(result) => result?,
            Err(_) => {
                error!("Fetching data timed out");
                return Ok(false);
            }
        };

        if status == StatusCode::OK {
            let parsed: ApplianceData = serde_json::from_str(&response_text)?;
            debug!("Fetched {} attributes for {}", parsed.attributes.len(), self.said);
            *self.data.lock().unwrap() = Some(parsed);
            Ok(true)
        } else {
            if let Ok(parsed) = serde_json::from_str::<ApplianceData>(&response_text) {
                *self.data.lock().unwrap() = Some(parsed);
            }
            error!("Fetching data failed ({})", status);
            Ok(false)
        }
    }

    /// Send a `setAttributes` command, retrying up to 3 attempts.
    ///
    /// A 401 refreshes the token and rebinds the HTTP session before the
    /// next attempt; the event socket keeps its old token snapshot. Any
    /// other failed attempt (including a timeout) is logged and counted.
    pub async fn send_attributes(&mut self, attributes: HashMap<String, String>) -> Result<bool> {
        if self.session.is_none() {
            error!("Session not started");
            return Ok(false);
        }

        info!("Sending attributes: {:?}", attributes);

        let url = format!("{}/api/v1/appliance/command", self.base_url);
        let envelope = CommandEnvelope::set_attributes(&self.said, attributes);

        let mut state = SendState::Attempt(1);
        loop {
            state = match state {
                SendState::Attempt(attempt) if attempt > SEND_ATTEMPTS => SendState::Failed,
                SendState::Attempt(attempt) => match self.send_command(&url, &envelope).await? {
                    Some(status) if status == StatusCode::OK => SendState::Success,
                    Some(status) if status == StatusCode::UNAUTHORIZED => {
                        SendState::ReauthAndRetry(attempt)
                    }
                    Some(status) => {
                        error!("Sending attributes failed ({})", status);
                        SendState::Attempt(attempt + 1)
                    }
                    None => {
                        error!("Sending attributes timed out");
                        SendState::Attempt(attempt + 1)
                    }
                },
                SendState::ReauthAndRetry(attempt) => {
                    self.auth.do_auth(false).await?;
                    self.start_http_session()?;
                    SendState::Attempt(attempt + 1)
                }
                SendState::Success => return Ok(true),
                SendState::Failed => return Ok(false),
            };
        }
    }

    /// One command POST. `Ok(None)` means the attempt timed out.
    async fn send_command(
        &self,
        url: &str,
        envelope: &CommandEnvelope,
    ) -> Result<Option<StatusCode>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Api("Session not started".to_string()))?;

        let request = async {
            let response = session.post(url).json(envelope).send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
            Ok(result) => {
                let (status, text) = result?;
                debug!("Reply: {}", text);
                Ok(Some(status))
            }
            Err(_) => Ok(None),
        }
    }

    /// Look up the attribute's current value. Fails with
    /// [`Error::NotFound`] when the table was never populated or the name
    /// is absent -- call [`has_attribute`](Self::has_attribute) first.
    pub fn get_attribute(&self, attribute: &str) -> Result<String> {
        self.data
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|data| data.attributes.get(attribute))
            .map(|attr| attr.value.clone())
            .ok_or_else(|| Error::NotFound(format!("attribute {}", attribute)))
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.data
            .lock()
            .unwrap()
            .as_ref()
            .map(|data| data.attributes.contains_key(attribute))
            .unwrap_or(false)
    }

    /// Resolve the appliance's display name via the account listing.
    pub async fn fetch_name(&self) -> Result<Option<String>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Api("Session not started".to_string()))?;

        let response = session
            .get(format!("{}/api/v1/getUserDetails", self.base_url))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let details: UserDetails = serde_json::from_str(&response.text().await?)?;

        let response = session
            .get(format!(
                "{}/api/v1/appliancebyaccount/{}",
                self.base_url, details.account_id
            ))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let listing: AccountAppliances = serde_json::from_str(&response.text().await?)?;

        if let Some(categories) = listing.get(&details.account_id.to_string()) {
            for appliances in categories.values() {
                for appliance in appliances {
                    if appliance.said == self.said {
                        return Ok(Some(appliance.appliance_name.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Apply one event message to the attribute table.
    ///
    /// Only keys already present in the table are written; the table's key
    /// set never grows from pushes. The change callback fires once per
    /// parsed message.
    fn apply_event_message(
        data: &Mutex<Option<ApplianceData>>,
        attr_changed: Option<&ChangeCallback>,
        msg: &str,
    ) {
        let event: EventMessage = match serde_json::from_str(msg) {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to parse event message: {}", e);
                return;
            }
        };

        {
            let mut guard = data.lock().unwrap();
            if let Some(data) = guard.as_mut() {
                for (name, value) in &event.attribute_map {
                    if let Some(attr) = data.attributes.get_mut(name) {
                        let value = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        debug!(
                            "Updating attribute {} with {} ({})",
                            name, value, event.timestamp
                        );
                        attr.value = value;
                        attr.update_time = event.timestamp;
                    }
                }
            }
        }

        if let Some(callback) = attr_changed {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attribute;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table_with(entries: &[(&str, &str, i64)]) -> SharedData {
        let attributes = entries
            .iter()
            .map(|(name, value, time)| {
                (
                    name.to_string(),
                    Attribute {
                        value: value.to_string(),
                        update_time: *time,
                    },
                )
            })
            .collect();
        Arc::new(Mutex::new(Some(ApplianceData { attributes })))
    }

    fn counting_callback() -> (ChangeCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: ChangeCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_event_updates_known_attribute() {
        let data = table_with(&[("Sink_SetTemp", "1", 50)]);
        let (callback, count) = counting_callback();

        let msg = r#"{"timestamp": 100, "attributeMap": {"Sink_SetTemp": 3}}"#;
        Appliance::apply_event_message(&data, Some(&callback), msg);

        let guard = data.lock().unwrap();
        let attr = &guard.as_ref().unwrap().attributes["Sink_SetTemp"];
        assert_eq!(attr.value, "3");
        assert_eq!(attr.update_time, 100);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_ignores_unknown_attribute() {
        let data = table_with(&[("Sink_SetTemp", "1", 50)]);
        let (callback, count) = counting_callback();

        let msg = r#"{"timestamp": 100, "attributeMap": {"Unknown_Attr": "7"}}"#;
        Appliance::apply_event_message(&data, Some(&callback), msg);

        let guard = data.lock().unwrap();
        let table = &guard.as_ref().unwrap().attributes;
        assert!(!table.contains_key("Unknown_Attr"));
        assert_eq!(table["Sink_SetTemp"].value, "1");
        assert_eq!(table["Sink_SetTemp"].update_time, 50);
        // The callback still fires once per message.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_on_unpopulated_table() {
        let data: SharedData = Arc::new(Mutex::new(None));
        let (callback, count) = counting_callback();

        let msg = r#"{"timestamp": 100, "attributeMap": {"Sink_SetTemp": 3}}"#;
        Appliance::apply_event_message(&data, Some(&callback), msg);

        assert!(data.lock().unwrap().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_event_is_dropped() {
        let data = table_with(&[("Sink_SetTemp", "1", 50)]);
        let (callback, count) = counting_callback();

        Appliance::apply_event_message(&data, Some(&callback), "not json");

        assert_eq!(data.lock().unwrap().as_ref().unwrap().attributes["Sink_SetTemp"].value, "1");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attribute_lookup_before_fetch() {
        let auth = Arc::new(Auth::new("email", "secretpass"));
        let appliance = Appliance::new(auth, "SAID1", None);

        assert!(!appliance.has_attribute("Sink_SetTemp"));
        assert!(matches!(
            appliance.get_attribute("Sink_SetTemp"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(appliance.said(), "SAID1");
    }
}
