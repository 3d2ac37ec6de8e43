//! HTTP server (axum)
//!
//! Receives the WhatsApp webhook and exposes patient registration and the
//! daily adherence report.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::clock::Calendar;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{Medication, Patient};
use crate::reply::{normalize_phone, ReplyInterpreter, ReplyOutcome};
use crate::schedule;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub replies: Arc<ReplyInterpreter>,
    pub calendar: Calendar,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .route("/api/patients", post(register_patient))
        .route("/api/patients/{id}/report", get(patient_report))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> AppResult<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("HTTP server listening on http://0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Custom(format!("Server bind error: {}", e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::Custom(format!("Server error: {}", e)))?;

    Ok(())
}

fn error_response(e: AppError) -> Response {
    let status = match e {
        AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => {
            log::error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

// ============ Handlers ============

async fn health_handler() -> &'static str {
    "OK"
}

/// Fields posted by the WhatsApp gateway; everything else is ignored.
#[derive(Debug, Deserialize)]
struct WebhookForm {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body", default)]
    body: String,
}

async fn whatsapp_webhook(State(state): State<AppState>, Form(form): Form<WebhookForm>) -> Response {
    match state.replies.handle_reply(&form.from, &form.body).await {
        Ok(outcome @ ReplyOutcome::PatientNotFound { .. }) => {
            (StatusCode::NOT_FOUND, Json(outcome)).into_response()
        }
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPatientRequest {
    name: String,
    phone: String,
    #[serde(default)]
    medications: Vec<MedicationRequest>,
}

#[derive(Debug, Deserialize)]
struct MedicationRequest {
    name: String,
    #[serde(default)]
    dosage: String,
    days: Vec<u8>,
    times: Vec<String>,
}

impl RegisterPatientRequest {
    fn into_records(self, country_code: &str) -> AppResult<(Patient, Vec<Medication>)> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("name is required".to_string()));
        }
        let phone = normalize_phone(&self.phone, country_code);
        if phone.is_empty() {
            return Err(AppError::InvalidInput(format!("invalid phone number: {}", self.phone)));
        }

        let patient = Patient::new(name.to_string(), phone);
        let mut medications = Vec::with_capacity(self.medications.len());
        for m in self.medications {
            if m.name.trim().is_empty() {
                return Err(AppError::InvalidInput("medication name is required".to_string()));
            }
            if m.days.is_empty() || m.times.is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "medication {} needs at least one day and one time",
                    m.name
                )));
            }
            if let Some(day) = m.days.iter().find(|d| **d > 6) {
                return Err(AppError::InvalidInput(format!("invalid weekday {}", day)));
            }
            if let Some(time) = m.times.iter().find(|t| !schedule::is_valid_time_of_day(t)) {
                return Err(AppError::InvalidInput(format!("invalid time {}, expected HH:MM", time)));
            }
            medications.push(Medication::new(
                patient.id.clone(),
                m.name.trim().to_string(),
                m.dosage.trim().to_string(),
                m.days,
                m.times,
            ));
        }
        Ok((patient, medications))
    }
}

async fn register_patient(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPatientRequest>,
) -> Response {
    let (patient, medications) = match payload.into_records(state.replies.country_code()) {
        Ok(records) => records,
        Err(e) => return error_response(e),
    };

    match state.db.find_patient_by_phone(&patient.phone) {
        Ok(Some(existing)) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"error": "phone already registered", "patient_id": existing.id})),
            )
                .into_response()
        }
        Ok(None) => {}
        Err(e) => return error_response(e),
    }

    if let Err(e) = state.db.register_patient(&patient, &medications) {
        return error_response(e);
    }
    log::info!("Registered patient {} with {} medications", patient.id, medications.len());

    (
        StatusCode::CREATED,
        Json(serde_json::json!({"patient": patient, "medications": medications})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    date: Option<String>,
}

async fn patient_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let date = match query.date.as_deref() {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                return error_response(AppError::InvalidInput(format!(
                    "invalid date {}, expected YYYY-MM-DD",
                    raw
                )))
            }
        },
        None => state.calendar.local_now().date_naive(),
    };

    match state.db.get_patient(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "patient not found"}))).into_response()
        }
        Err(e) => return error_response(e),
    }

    match state.db.daily_report(&id, date, state.calendar.timezone()) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}
