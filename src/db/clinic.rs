//! SQL behind the clinic domain operations.
use super::repo::Pool;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

#[instrument(skip_all)]
pub async fn insert_patient(
    pool: &Pool,
    first_name: &str,
    last_name: &str,
    email: &str,
    phone: &str,
    date_of_birth: Option<NaiveDate>,
) -> Result<i64, sqlx::Error> {
    let rec = sqlx::query(
        "INSERT INTO patients (first_name, last_name, email, phone, date_of_birth, is_active, created_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?) RETURNING id",
    )
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(phone)
    .bind(date_of_birth)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn insert_doctor(
    pool: &Pool,
    first_name: &str,
    last_name: &str,
    email: &str,
    phone: &str,
    specialty: &str,
    license_number: &str,
) -> Result<i64, sqlx::Error> {
    let rec = sqlx::query(
        "INSERT INTO doctors (first_name, last_name, email, phone, specialty, license_number, is_active, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 1, ?) RETURNING id",
    )
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(phone)
    .bind(specialty)
    .bind(license_number)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn patient_email_taken(pool: &Pool, email: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM patients WHERE lower(email) = lower(?) LIMIT 1")
            .bind(email)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

pub async fn doctor_license_taken(pool: &Pool, license_number: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM doctors WHERE license_number = ? LIMIT 1")
            .bind(license_number)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

pub async fn patient_exists(pool: &Pool, id: i64) -> Result<bool, sqlx::Error> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM patients WHERE id = ? AND is_active = 1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

pub async fn doctor_exists(pool: &Pool, id: i64) -> Result<bool, sqlx::Error> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT id FROM doctors WHERE id = ? AND is_active = 1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

/// Must be the first statement of its transaction so the write lock is taken
/// before the invoice sequence is read.
pub async fn insert_appointment_tx(
    tx: &mut Transaction<'_, Sqlite>,
    patient_id: i64,
    doctor_id: i64,
    date: NaiveDate,
    time: &str,
    reason: &str,
) -> Result<i64, sqlx::Error> {
    let rec = sqlx::query(
        "INSERT INTO appointments (patient_id, doctor_id, appointment_date, appointment_time, reason, status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'Scheduled', ?) RETURNING id",
    )
    .bind(patient_id)
    .bind(doctor_id)
    .bind(date)
    .bind(time)
    .bind(reason)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Highest invoice number issued for the `INV-YYYYMMDD-` prefix, if any.
/// The sequence outgrows its zero padding, so longer numbers rank higher.
pub async fn last_invoice_number_tx(
    tx: &mut Transaction<'_, Sqlite>,
    prefix: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT invoice_number FROM invoices WHERE invoice_number LIKE ? || '%' \
         ORDER BY length(invoice_number) DESC, invoice_number DESC LIMIT 1",
    )
    .bind(prefix)
    .fetch_optional(&mut **tx)
    .await
}

pub async fn insert_invoice_tx(
    tx: &mut Transaction<'_, Sqlite>,
    appointment_id: i64,
    invoice_number: &str,
    sub_total: &BigDecimal,
    tax_amount: &BigDecimal,
    total_amount: &BigDecimal,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO invoices (appointment_id, invoice_number, invoice_date, sub_total, tax_amount, total_amount, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'Pending', ?) RETURNING id",
    )
    .bind(appointment_id)
    .bind(invoice_number)
    .bind(now)
    .bind(sub_total.to_string())
    .bind(tax_amount.to_string())
    .bind(total_amount.to_string())
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

pub async fn count_rows(pool: &Pool, table: ClinicTable) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(table.count_sql()).fetch_one(pool).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinicTable {
    Patients,
    Doctors,
    Appointments,
    Invoices,
}

impl ClinicTable {
    fn count_sql(&self) -> &'static str {
        match self {
            ClinicTable::Patients => "SELECT COUNT(*) FROM patients",
            ClinicTable::Doctors => "SELECT COUNT(*) FROM doctors",
            ClinicTable::Appointments => "SELECT COUNT(*) FROM appointments",
            ClinicTable::Invoices => "SELECT COUNT(*) FROM invoices",
        }
    }
}
