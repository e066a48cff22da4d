//! Streaming CSV parser for import files.
//!
//! Lines are read one at a time from any `AsyncRead`, so a file is never held
//! in memory. Fields are split on `,` without quote handling. Positional rows
//! whose required fields do not coerce are dropped and never reach the
//! processor.
use crate::clinic::{NewDoctor, NewPatient};
use crate::model::ImportKind;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Columns of the positional appointment layout, in order.
pub const APPOINTMENT_COLUMNS: [&str; 6] = [
    "PatientId",
    "DoctorId",
    "AppointmentDate",
    "AppointmentTime",
    "Reason",
    "VisitFee",
];

/// Row of the positional appointment-only layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRow {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub date: NaiveDate,
    pub time: String,
    pub reason: String,
    /// Parsed for completeness; the processor does not forward it.
    pub visit_fee: Option<BigDecimal>,
}

/// Row of the unified layout carrying patient, doctor and appointment fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedRow {
    pub patient_id: Option<i64>,
    pub patient: NewPatient,
    pub doctor_id: Option<i64>,
    pub doctor: NewDoctor,
    pub date: NaiveDate,
    pub time: String,
    pub reason: String,
    pub visit_fee: Option<BigDecimal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRecord {
    Appointment(AppointmentRow),
    Unified(UnifiedRow),
}

/// How a header line maps cells of later lines into a record.
trait RowLayout: Sized + Send {
    type Record: Send;

    /// `None` rejects the whole file.
    fn from_header(header: &str) -> Option<Self>;

    /// `None` drops the row.
    fn parse_row(&self, cells: &[&str]) -> Option<Self::Record>;
}

struct PositionalLayout;

impl RowLayout for PositionalLayout {
    type Record = AppointmentRow;

    fn from_header(header: &str) -> Option<Self> {
        let columns = header.split(',').count();
        if columns < APPOINTMENT_COLUMNS.len() {
            warn!(
                columns,
                expected = APPOINTMENT_COLUMNS.len(),
                "appointment header has too few columns; ignoring file"
            );
            return None;
        }
        Some(PositionalLayout)
    }

    fn parse_row(&self, cells: &[&str]) -> Option<AppointmentRow> {
        if cells.len() < APPOINTMENT_COLUMNS.len() {
            return None;
        }
        Some(AppointmentRow {
            patient_id: cells[0].parse().ok()?,
            doctor_id: cells[1].parse().ok()?,
            date: parse_invariant_date(cells[2])?,
            time: cells[3].to_string(),
            reason: cells[4].to_string(),
            visit_fee: parse_decimal(cells[5]),
        })
    }
}

/// Column indexes resolved from a unified header; absent columns are `None`.
struct UnifiedLayout {
    patient_id: Option<usize>,
    patient_first_name: Option<usize>,
    patient_last_name: Option<usize>,
    patient_email: Option<usize>,
    patient_phone: Option<usize>,
    patient_dob: Option<usize>,
    doctor_id: Option<usize>,
    doctor_first_name: Option<usize>,
    doctor_last_name: Option<usize>,
    doctor_email: Option<usize>,
    doctor_phone: Option<usize>,
    specialty: Option<usize>,
    license_number: Option<usize>,
    date: Option<usize>,
    time: Option<usize>,
    reason: Option<usize>,
    visit_fee: Option<usize>,
}

impl RowLayout for UnifiedLayout {
    type Record = UnifiedRow;

    fn from_header(header: &str) -> Option<Self> {
        let mut map: HashMap<String, usize> = HashMap::new();
        for (idx, name) in header.split(',').enumerate() {
            // first occurrence wins on duplicate names
            map.entry(name.trim().to_ascii_lowercase()).or_insert(idx);
        }
        let col = |name: &str| map.get(&name.to_ascii_lowercase()).copied();
        Some(UnifiedLayout {
            patient_id: col("PatientId"),
            patient_first_name: col("PatientFirstName"),
            patient_last_name: col("PatientLastName"),
            patient_email: col("PatientEmail"),
            patient_phone: col("PatientPhone"),
            patient_dob: col("PatientDob"),
            doctor_id: col("DoctorId"),
            doctor_first_name: col("DoctorFirstName"),
            doctor_last_name: col("DoctorLastName"),
            doctor_email: col("DoctorEmail"),
            doctor_phone: col("DoctorPhone"),
            specialty: col("Specialty"),
            license_number: col("LicenseNumber"),
            date: col("AppointmentDate"),
            time: col("AppointmentTime"),
            reason: col("Reason"),
            visit_fee: col("VisitFee"),
        })
    }

    fn parse_row(&self, cells: &[&str]) -> Option<UnifiedRow> {
        let get = |idx: Option<usize>| cell(cells, idx);
        let text = |idx: Option<usize>| cell(cells, idx).to_string();

        Some(UnifiedRow {
            // unified rows are never dropped; an unusable date means today
            date: parse_invariant_date(get(self.date)).unwrap_or_else(|| Utc::now().date_naive()),
            patient_id: get(self.patient_id).parse().ok(),
            patient: NewPatient {
                first_name: text(self.patient_first_name),
                last_name: text(self.patient_last_name),
                email: text(self.patient_email),
                phone: text(self.patient_phone),
                date_of_birth: parse_invariant_date(get(self.patient_dob)),
            },
            doctor_id: get(self.doctor_id).parse().ok(),
            doctor: NewDoctor {
                first_name: text(self.doctor_first_name),
                last_name: text(self.doctor_last_name),
                email: text(self.doctor_email),
                phone: text(self.doctor_phone),
                specialty: text(self.specialty),
                license_number: text(self.license_number),
            },
            time: text(self.time),
            reason: text(self.reason),
            visit_fee: parse_decimal(get(self.visit_fee)),
        })
    }
}

fn cell<'a>(cells: &[&'a str], idx: Option<usize>) -> &'a str {
    idx.and_then(|i| cells.get(i)).copied().unwrap_or("")
}

/// Line reader that stops once the token is cancelled.
struct LineSource<R> {
    lines: Lines<BufReader<R>>,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.cancel.is_cancelled() {
            debug!("parse cancelled");
            return Ok(None);
        }
        self.lines.next_line().await
    }
}

enum ParseState<R, L> {
    Header(LineSource<R>),
    Rows(LineSource<R>, L),
    Done,
}

fn records<R, L>(reader: R, cancel: CancellationToken) -> impl Stream<Item = io::Result<L::Record>>
where
    R: AsyncRead + Unpin + Send,
    L: RowLayout,
{
    let source = LineSource {
        lines: BufReader::new(reader).lines(),
        cancel,
    };
    stream::unfold(ParseState::<R, L>::Header(source), |state| async move {
        let (mut source, layout) = match state {
            ParseState::Header(mut source) => {
                let header = match source.next_line().await {
                    Ok(Some(header)) => header,
                    Ok(None) => return None,
                    Err(err) => return Some((Err(err), ParseState::Done)),
                };
                let header = header.trim_start_matches('\u{feff}');
                (source, L::from_header(header)?)
            }
            ParseState::Rows(source, layout) => (source, layout),
            ParseState::Done => return None,
        };

        loop {
            let line = match source.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => return Some((Err(err), ParseState::Done)),
            };
            if line.trim().is_empty() {
                continue;
            }
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            match layout.parse_row(&cells) {
                Some(record) => return Some((Ok(record), ParseState::Rows(source, layout))),
                None => debug!(line = %line, "dropping row with unparseable required fields"),
            }
        }
    })
}

/// Lazily parse the positional appointment layout.
pub fn parse_appointments<R>(
    reader: R,
    cancel: CancellationToken,
) -> impl Stream<Item = io::Result<AppointmentRow>>
where
    R: AsyncRead + Unpin + Send,
{
    records::<R, PositionalLayout>(reader, cancel)
}

/// Lazily parse the unified layout.
pub fn parse_unified<R>(reader: R, cancel: CancellationToken) -> impl Stream<Item = io::Result<UnifiedRow>>
where
    R: AsyncRead + Unpin + Send,
{
    records::<R, UnifiedLayout>(reader, cancel)
}

/// Parse `reader` with the layout of `kind`.
pub fn parse_file<'a, R>(
    kind: ImportKind,
    reader: R,
    cancel: CancellationToken,
) -> BoxStream<'a, io::Result<ParsedRecord>>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    match kind {
        ImportKind::Appointments => parse_appointments(reader, cancel)
            .map_ok(ParsedRecord::Appointment)
            .boxed(),
        ImportKind::Unified => parse_unified(reader, cancel)
            .map_ok(ParsedRecord::Unified)
            .boxed(),
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 12] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y/%m/%dT%H:%M:%S",
    "%Y/%m/%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%YT%H:%M:%S",
    "%m/%d/%YT%H:%M",
];

/// Culture-independent date parse. Accepts ISO and US-style dates, optionally
/// followed by a time of day which is discarded.
pub fn parse_invariant_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Decimal parse tolerating a sign and `,` group separators.
pub fn parse_decimal(s: &str) -> Option<BigDecimal> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}
