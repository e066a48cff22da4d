//! Domain operations the import pipeline drives: create patient, create doctor,
//! schedule an appointment together with its invoice.
//!
//! The pipeline only sees [`ClinicOps`]; [`SqliteClinic`] is the implementation
//! backed by the daemon's own database.
use crate::db::{self, clinic as sql, Pool};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ClinicError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub date_of_birth: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewDoctor {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub specialty: String,
    pub license_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRequest {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub date: NaiveDate,
    pub time: String,
    pub reason: String,
    pub visit_fee: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAppointment {
    pub appointment_id: i64,
    pub invoice_id: i64,
    pub invoice_number: String,
}

#[async_trait]
pub trait ClinicOps: Send + Sync {
    /// `skip_validation` bypasses field and duplicate checks; bulk imports use it.
    async fn create_patient(
        &self,
        patient: &NewPatient,
        skip_validation: bool,
    ) -> Result<i64, ClinicError>;

    async fn create_doctor(&self, doctor: &NewDoctor, skip_validation: bool)
        -> Result<i64, ClinicError>;

    async fn schedule_appointment_with_invoice(
        &self,
        request: &AppointmentRequest,
    ) -> Result<ScheduledAppointment, ClinicError>;
}

#[derive(Debug, Clone)]
pub struct SqliteClinic {
    pool: Pool,
}

impl SqliteClinic {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn validate_patient(&self, patient: &NewPatient) -> Result<(), ClinicError> {
        if patient.first_name.trim().is_empty() || patient.last_name.trim().is_empty() {
            return Err(ClinicError::Validation(
                "patient first and last name are required".into(),
            ));
        }
        if !patient.email.is_empty() && sql::patient_email_taken(&self.pool, &patient.email).await?
        {
            return Err(ClinicError::Validation(format!(
                "a patient with email {} already exists",
                patient.email
            )));
        }
        Ok(())
    }

    async fn validate_doctor(&self, doctor: &NewDoctor) -> Result<(), ClinicError> {
        if doctor.first_name.trim().is_empty() || doctor.last_name.trim().is_empty() {
            return Err(ClinicError::Validation(
                "doctor first and last name are required".into(),
            ));
        }
        if !doctor.license_number.is_empty()
            && sql::doctor_license_taken(&self.pool, &doctor.license_number).await?
        {
            return Err(ClinicError::Validation(format!(
                "a doctor with license {} already exists",
                doctor.license_number
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClinicOps for SqliteClinic {
    #[instrument(skip_all)]
    async fn create_patient(
        &self,
        patient: &NewPatient,
        skip_validation: bool,
    ) -> Result<i64, ClinicError> {
        if !skip_validation {
            self.validate_patient(patient).await?;
        }
        let id = sql::insert_patient(
            &self.pool,
            &patient.first_name,
            &patient.last_name,
            &patient.email,
            &patient.phone,
            patient.date_of_birth,
        )
        .await?;
        debug!(patient_id = id, "patient created");
        Ok(id)
    }

    #[instrument(skip_all)]
    async fn create_doctor(
        &self,
        doctor: &NewDoctor,
        skip_validation: bool,
    ) -> Result<i64, ClinicError> {
        if !skip_validation {
            self.validate_doctor(doctor).await?;
        }
        let id = sql::insert_doctor(
            &self.pool,
            &doctor.first_name,
            &doctor.last_name,
            &doctor.email,
            &doctor.phone,
            &doctor.specialty,
            &doctor.license_number,
        )
        .await?;
        debug!(doctor_id = id, "doctor created");
        Ok(id)
    }

    #[instrument(skip_all, fields(patient_id = request.patient_id, doctor_id = request.doctor_id))]
    async fn schedule_appointment_with_invoice(
        &self,
        request: &AppointmentRequest,
    ) -> Result<ScheduledAppointment, ClinicError> {
        if request.time.trim().is_empty() {
            return Err(ClinicError::Validation("appointment time is required".into()));
        }
        if request.visit_fee < BigDecimal::zero() {
            return Err(ClinicError::Validation("visit fee must not be negative".into()));
        }
        if !sql::patient_exists(&self.pool, request.patient_id).await? {
            return Err(ClinicError::NotFound {
                entity: "patient",
                id: request.patient_id,
            });
        }
        if !sql::doctor_exists(&self.pool, request.doctor_id).await? {
            return Err(ClinicError::NotFound {
                entity: "doctor",
                id: request.doctor_id,
            });
        }

        let (tax, total) = invoice_amounts(&request.visit_fee);
        let prefix = format!("INV-{}-", Utc::now().format("%Y%m%d"));

        let mut tx = self.pool.begin().await?;
        let appointment_id = sql::insert_appointment_tx(
            &mut tx,
            request.patient_id,
            request.doctor_id,
            request.date,
            &request.time,
            &request.reason,
        )
        .await?;
        let last = sql::last_invoice_number_tx(&mut tx, &prefix).await?;
        let invoice_number = next_invoice_number(&prefix, last.as_deref());
        let invoice_id = sql::insert_invoice_tx(
            &mut tx,
            appointment_id,
            &invoice_number,
            &request.visit_fee,
            &tax,
            &total,
        )
        .await?;
        tx.commit().await?;

        debug!(appointment_id, invoice_id, %invoice_number, "appointment scheduled");
        Ok(ScheduledAppointment {
            appointment_id,
            invoice_id,
            invoice_number,
        })
    }
}

/// Tax is a flat 8 % of the visit fee, rounded to cents.
fn invoice_amounts(visit_fee: &BigDecimal) -> (BigDecimal, BigDecimal) {
    let tax = (visit_fee * BigDecimal::from(8) / BigDecimal::from(100)).round(2);
    let total = visit_fee + &tax;
    (tax, total)
}

fn next_invoice_number(prefix: &str, last: Option<&str>) -> String {
    let next = last
        .and_then(|n| n.strip_prefix(prefix))
        .and_then(|seq| seq.parse::<u32>().ok())
        .map_or(1, |seq| seq + 1);
    format!("{}{:04}", prefix, next)
}

/// Rows currently stored for a clinic table.
pub async fn count(pool: &Pool, table: sql::ClinicTable) -> anyhow::Result<i64> {
    Ok(db::clinic::count_rows(pool, table).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::str::FromStr;

    async fn setup_clinic() -> (Pool, SqliteClinic) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        (pool.clone(), SqliteClinic::new(pool))
    }

    fn patient(email: &str) -> NewPatient {
        NewPatient {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: email.into(),
            ..Default::default()
        }
    }

    fn doctor() -> NewDoctor {
        NewDoctor {
            first_name: "Gregory".into(),
            last_name: "House".into(),
            license_number: "LIC-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn invoice_numbers_continue_the_daily_sequence() {
        assert_eq!(next_invoice_number("INV-20250201-", None), "INV-20250201-0001");
        assert_eq!(
            next_invoice_number("INV-20250201-", Some("INV-20250201-0041")),
            "INV-20250201-0042"
        );
    }

    #[test]
    fn tax_is_eight_percent() {
        let (tax, total) = invoice_amounts(&BigDecimal::from(100));
        assert_eq!(tax, BigDecimal::from(8));
        assert_eq!(total, BigDecimal::from(108));
        let (tax, _) = invoice_amounts(&BigDecimal::from_str("12.50").unwrap());
        assert_eq!(tax, BigDecimal::from_str("1.00").unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_only_rejected_when_validating() {
        let (_pool, clinic) = setup_clinic().await;
        clinic.create_patient(&patient("a@x.io"), false).await.unwrap();
        let err = clinic
            .create_patient(&patient("A@x.io"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));
        clinic.create_patient(&patient("a@x.io"), true).await.unwrap();
    }

    #[tokio::test]
    async fn schedule_creates_appointment_and_invoice() {
        let (pool, clinic) = setup_clinic().await;
        let patient_id = clinic.create_patient(&patient(""), true).await.unwrap();
        let doctor_id = clinic.create_doctor(&doctor(), false).await.unwrap();
        let request = AppointmentRequest {
            patient_id,
            doctor_id,
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            time: "10:00".into(),
            reason: "Checkup".into(),
            visit_fee: BigDecimal::from(100),
        };
        let first = clinic.schedule_appointment_with_invoice(&request).await.unwrap();
        let second = clinic.schedule_appointment_with_invoice(&request).await.unwrap();
        assert!(first.invoice_number.ends_with("-0001"));
        assert!(second.invoice_number.ends_with("-0002"));
        assert_eq!(count(&pool, sql::ClinicTable::Invoices).await.unwrap(), 2);

        let total: String =
            sqlx::query_scalar("SELECT total_amount FROM invoices WHERE id = ?")
                .bind(first.invoice_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(BigDecimal::from_str(&total).unwrap(), BigDecimal::from(108));
    }

    #[tokio::test]
    async fn invoice_sequence_continues_past_four_digits() {
        let (pool, clinic) = setup_clinic().await;
        let patient_id = clinic.create_patient(&patient(""), true).await.unwrap();
        let doctor_id = clinic.create_doctor(&doctor(), true).await.unwrap();
        let request = AppointmentRequest {
            patient_id,
            doctor_id,
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            time: "10:00".into(),
            reason: String::new(),
            visit_fee: BigDecimal::zero(),
        };
        let first = clinic.schedule_appointment_with_invoice(&request).await.unwrap();
        let prefix = &first.invoice_number[..first.invoice_number.len() - 4];
        sqlx::query("UPDATE invoices SET invoice_number = ? WHERE id = ?")
            .bind(format!("{}9999", prefix))
            .bind(first.invoice_id)
            .execute(&pool)
            .await
            .unwrap();

        let next = clinic.schedule_appointment_with_invoice(&request).await.unwrap();
        assert_eq!(next.invoice_number, format!("{}10000", prefix));
        let after = clinic.schedule_appointment_with_invoice(&request).await.unwrap();
        assert_eq!(after.invoice_number, format!("{}10001", prefix));
    }

    #[tokio::test]
    async fn schedule_rejects_unknown_patient() {
        let (pool, clinic) = setup_clinic().await;
        let doctor_id = clinic.create_doctor(&doctor(), true).await.unwrap();
        let request = AppointmentRequest {
            patient_id: 999,
            doctor_id,
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            time: "10:00".into(),
            reason: String::new(),
            visit_fee: BigDecimal::zero(),
        };
        let err = clinic
            .schedule_appointment_with_invoice(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::NotFound { entity: "patient", id: 999 }));
        assert_eq!(count(&pool, sql::ClinicTable::Appointments).await.unwrap(), 0);
    }
}
