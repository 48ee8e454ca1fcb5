//! Clinical-workflow collaborator consumed by the peer connection
//! manager. The production implementation lives with the platform's
//! persistence layer; this crate only defines the seam and ships an
//! in-memory variant for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::ClientError;

/// Resolved appointment/session identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    pub session_id: String,
    pub appointment_id: Option<String>,
    pub therapist_id: String,
    pub patient_id: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed: bool,
}

#[async_trait]
pub trait ClinicalIntegration: Send + Sync {
    async fn get_session_details(&self, session_id: &str)
        -> Result<SessionDetails, ClientError>;

    async fn get_session_details_by_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<SessionDetails, ClientError>;

    /// Whether the patient has granted consent for this session.
    async fn check_consent(&self, session_id: &str, patient_id: &str)
        -> Result<bool, ClientError>;

    async fn record_consent(
        &self,
        session_id: &str,
        patient_id: &str,
        granted: bool,
    ) -> Result<(), ClientError>;

    /// Mark the session complete, optionally attaching clinician notes.
    async fn complete_session(
        &self,
        session_id: &str,
        notes: Option<&str>,
    ) -> Result<bool, ClientError>;
}

/// In-memory clinical directory.
#[derive(Default)]
pub struct InMemoryClinical {
    sessions: RwLock<HashMap<String, SessionDetails>>,
    consents: RwLock<HashMap<(String, String), bool>>,
}

impl InMemoryClinical {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, details: SessionDetails) {
        self.sessions
            .write()
            .await
            .insert(details.session_id.clone(), details);
    }
}

#[async_trait]
impl ClinicalIntegration for InMemoryClinical {
    async fn get_session_details(
        &self,
        session_id: &str,
    ) -> Result<SessionDetails, ClientError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ClientError::Clinical(format!("unknown session {session_id}")))
    }

    async fn get_session_details_by_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<SessionDetails, ClientError> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.appointment_id.as_deref() == Some(appointment_id))
            .cloned()
            .ok_or_else(|| {
                ClientError::Clinical(format!("no session for appointment {appointment_id}"))
            })
    }

    async fn check_consent(
        &self,
        session_id: &str,
        patient_id: &str,
    ) -> Result<bool, ClientError> {
        Ok(self
            .consents
            .read()
            .await
            .get(&(session_id.to_string(), patient_id.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn record_consent(
        &self,
        session_id: &str,
        patient_id: &str,
        granted: bool,
    ) -> Result<(), ClientError> {
        self.consents
            .write()
            .await
            .insert((session_id.to_string(), patient_id.to_string()), granted);
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        _notes: Option<&str>,
    ) -> Result<bool, ClientError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(details) => {
                details.completed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consent_defaults_to_absent_and_is_recordable() {
        let clinical = InMemoryClinical::new();
        assert!(!clinical.check_consent("s1", "p1").await.unwrap());
        clinical.record_consent("s1", "p1", true).await.unwrap();
        assert!(clinical.check_consent("s1", "p1").await.unwrap());
        clinical.record_consent("s1", "p1", false).await.unwrap();
        assert!(!clinical.check_consent("s1", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn appointment_lookup_and_completion() {
        let clinical = InMemoryClinical::new();
        clinical
            .insert_session(SessionDetails {
                session_id: "s1".into(),
                appointment_id: Some("a9".into()),
                therapist_id: "t1".into(),
                patient_id: "p1".into(),
                scheduled_at: None,
                completed: false,
            })
            .await;

        let details = clinical
            .get_session_details_by_appointment("a9")
            .await
            .unwrap();
        assert_eq!(details.session_id, "s1");

        assert!(clinical
            .complete_session("s1", Some("routine check-in"))
            .await
            .unwrap());
        assert!(clinical.get_session_details("s1").await.unwrap().completed);
        assert!(!clinical.complete_session("nope", None).await.unwrap());
    }
}
