//! Session Lifecycle Module
//!
//! Drives a driver from anonymous to sharing their bus location:
//!
//! ```text
//! Anonymous -> Authenticated -> RouteRegistered -> Sharing
//! ```
//!
//! Each step validates its form before touching the network and writes
//! what the server hands back through the [`Session`](crate::auth::Session).
//! Every outcome maps to a [`Notice`] for the user.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use tracing::{error, info, warn};

use crate::api::{AddBusRequest, ApiClient, RequestError};
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    RouteRegistered,
    Sharing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Anonymous => write!(f, "anonymous"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::RouteRegistered => write!(f, "route-registered"),
            SessionState::Sharing => write!(f, "sharing"),
        }
    }
}

/// User-triggered operations, used to pick notice wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Login,
    Signup,
    SaveRoute,
    StartSharing,
    Logout,
}

#[derive(Debug, Clone, Default)]
pub struct LoginForm {
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignupForm {
    pub name: String,
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouteForm {
    pub bus_number: String,
    pub from_city: String,
    pub to_city: String,
    pub shift_start_time: String,
    pub shift_end_time: String,
}

impl RouteForm {
    /// Fill the shift start with `now` as `hh:mm AM`
    pub fn stamp_shift_start<Tz: TimeZone>(&mut self, now: &DateTime<Tz>)
    where
        Tz::Offset: Display,
    {
        self.shift_start_time = shift_clock(now);
    }

    /// Fill the shift end with `now` as `hh:mm PM`
    pub fn stamp_shift_end<Tz: TimeZone>(&mut self, now: &DateTime<Tz>)
    where
        Tz::Offset: Display,
    {
        self.shift_end_time = shift_clock(now);
    }
}

fn shift_clock<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    now.format("%I:%M %p").to_string()
}

/// Which form failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Login,
    Signup,
    Route,
}

/// One or more required fields were blank. Raised before any request is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Missing required field(s): {}", .missing.join(", "))]
pub struct ValidationError {
    pub form: FormKind,
    pub missing: Vec<&'static str>,
}

fn require(form: FormKind, fields: &[(&'static str, &str)]) -> Result<(), ValidationError> {
    let missing: Vec<&'static str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { form, missing })
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Session storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Cannot {action:?} while {state}")]
    InvalidState { action: Action, state: SessionState },
}

impl LifecycleError {
    /// Notice to show the user for this failure
    pub fn notice(&self, action: Action) -> Notice {
        match self {
            LifecycleError::Validation(e) => Notice::error(match e.form {
                FormKind::Login => "Please enter phone and password",
                FormKind::Signup => "All fields are required",
                FormKind::Route => "Please fill in all fields",
            }),
            LifecycleError::Request(e) => match action {
                Action::Login => {
                    Notice::new("Login Failed", e.user_message("Invalid credentials"))
                }
                Action::Signup => {
                    Notice::new("Signup Failed", e.user_message("Something went wrong"))
                }
                Action::SaveRoute => Notice::error(e.user_message("Failed to save bus")),
                Action::StartSharing | Action::Logout => {
                    Notice::error(e.user_message("Something went wrong"))
                }
            },
            LifecycleError::Storage(e) => {
                Notice::error(format!("Could not save your session: {}", e))
            }
            LifecycleError::InvalidState { state, .. } => Notice::error(match state {
                SessionState::Anonymous => "Please log in first",
                _ => "Please save your bus and route first",
            }),
        }
    }
}

/// Modal message shown after an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: &'static str,
    pub message: String,
}

impl Notice {
    pub fn new(title: &'static str, message: impl Into<String>) -> Self {
        Self { title, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Notice for a successful action
    pub fn success(action: Action) -> Self {
        let message = match action {
            Action::Login => "Login successful!",
            Action::Signup => "Account created successfully!",
            Action::SaveRoute => "Bus & route saved successfully!",
            Action::StartSharing => "Location sharing started",
            Action::Logout => "Logged out",
        };
        Self::new("Success", message)
    }
}

/// Result of a route registration. The lifecycle advances even when the
/// server call failed; the failure is carried in `warning`.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub bus_id: Option<String>,
    pub warning: Option<LifecycleError>,
}

impl RouteOutcome {
    pub fn notice(&self) -> Notice {
        match &self.warning {
            Some(e) => e.notice(Action::SaveRoute),
            None => Notice::success(Action::SaveRoute),
        }
    }
}

/// Driver-side session state machine
pub struct SessionLifecycle {
    api: Arc<ApiClient>,
    state: SessionState,
}

impl SessionLifecycle {
    /// Start anonymous
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api, state: SessionState::Anonymous }
    }

    /// Start authenticated if a token survived from a previous run
    pub fn resume(api: Arc<ApiClient>) -> Result<Self, StorageError> {
        let state = if api.session().is_authenticated()? {
            info!("Resuming stored session");
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };
        Ok(Self { api, state })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Log in with phone and password.
    ///
    /// On failure the state and the stored token are left as they were.
    pub async fn login(&mut self, form: &LoginForm) -> Result<Notice, LifecycleError> {
        require(
            FormKind::Login,
            &[("phone", form.phone.as_str()), ("password", form.password.as_str())],
        )?;

        let response = self.api.login(&form.phone, &form.password).await.map_err(|e| {
            warn!("Login error: {}", e);
            e
        })?;

        self.persist_identity(&response.token, response.driver_id())?;
        self.transition(SessionState::Authenticated);
        Ok(Notice::success(Action::Login))
    }

    /// Create an account and log in with it
    pub async fn register(&mut self, form: &SignupForm) -> Result<Notice, LifecycleError> {
        require(
            FormKind::Signup,
            &[
                ("name", form.name.as_str()),
                ("phone", form.phone.as_str()),
                ("password", form.password.as_str()),
            ],
        )?;

        let response = self
            .api
            .register(&form.name, &form.phone, &form.password)
            .await
            .map_err(|e| {
                warn!("Signup error: {}", e);
                e
            })?;

        self.persist_identity(&response.token, response.driver_id())?;
        self.transition(SessionState::Authenticated);
        Ok(Notice::success(Action::Signup))
    }

    /// Register the driver's bus, route and shift.
    ///
    /// Blank fields stop here with a validation error. Once the request is
    /// sent the lifecycle moves on to `RouteRegistered` whatever the server
    /// answers, so the driver can still share their location.
    pub async fn register_route(
        &mut self,
        form: &RouteForm,
    ) -> Result<RouteOutcome, LifecycleError> {
        if self.state == SessionState::Anonymous {
            return Err(LifecycleError::InvalidState {
                action: Action::SaveRoute,
                state: self.state,
            });
        }

        require(
            FormKind::Route,
            &[
                ("busNumber", form.bus_number.as_str()),
                ("fromCity", form.from_city.as_str()),
                ("toCity", form.to_city.as_str()),
                ("shiftStartTime", form.shift_start_time.as_str()),
                ("shiftEndTime", form.shift_end_time.as_str()),
            ],
        )?;

        let request = AddBusRequest {
            bus_number: &form.bus_number,
            from_city: &form.from_city,
            to_city: &form.to_city,
            shift_start_time: &form.shift_start_time,
            shift_end_time: &form.shift_end_time,
        };

        let mut outcome = RouteOutcome { bus_id: None, warning: None };

        match self.api.add_bus(&request).await {
            Ok(response) => match response.bus_id() {
                Some(bus_id) => {
                    if let Err(e) = self.api.session().store_bus_id(bus_id) {
                        error!("Failed to save bus id: {}", e);
                        outcome.warning = Some(e.into());
                    }
                    outcome.bus_id = Some(bus_id.to_string());
                }
                None => warn!("Bus saved but no id was returned"),
            },
            Err(e) => {
                warn!("Bus save error: {}", e);
                outcome.warning = Some(e.into());
            }
        }

        self.transition(SessionState::RouteRegistered);
        Ok(outcome)
    }

    /// Begin sharing. Returns the stored bus id, if any, for the location
    /// publisher.
    pub fn start_sharing(&mut self) -> Result<Option<String>, LifecycleError> {
        match self.state {
            SessionState::RouteRegistered | SessionState::Sharing => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    action: Action::StartSharing,
                    state,
                })
            }
        }

        let bus_id = self.api.session().bus_id()?;
        self.transition(SessionState::Sharing);
        Ok(bus_id)
    }

    /// Forget the stored credentials and return to `Anonymous`
    pub fn logout(&mut self) -> Result<(), LifecycleError> {
        self.api.session().clear()?;
        self.transition(SessionState::Anonymous);
        Ok(())
    }

    /// Store the token and driver id together. If the driver id cannot be
    /// written the previous token is put back, so the store never holds a
    /// token the lifecycle did not advance on.
    fn persist_identity(&self, token: &str, driver_id: Option<&str>) -> Result<(), LifecycleError> {
        let session = self.api.session();
        let previous = session.token()?;
        session.store_token(token).map_err(|e| {
            error!("Failed to save token: {}", e);
            e
        })?;

        let Some(driver_id) = driver_id else {
            return Ok(());
        };
        if let Err(e) = session.store_driver_id(driver_id) {
            error!("Failed to save driver id: {}", e);
            if let Err(restore) = session.restore_token(previous.as_deref()) {
                error!("Failed to restore previous token: {}", restore);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session state: {} -> {}", self.state, next);
        }
        self.state = next;
    }
}
