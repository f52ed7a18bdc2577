use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::constants::{MAX_PROGRESS_INTERVAL, MIN_PROGRESS_INTERVAL};
use crate::normalize::{
    canonical_bin, canonical_code, canonical_dea, canonical_gender, canonical_nabp,
    canonical_ndc11, canonical_npi, canonical_state, canonical_zip, normalize_boolean,
    normalize_currency, normalize_date, normalize_integer, normalize_text,
};
use crate::raw_row::{Cell, RawRow};
use crate::records::{
    ClaimEvent, DrugFields, Parties, PatientFields, PharmacyFields, PlanFields,
    PrescriberFields, PrescriptionEvent, RecordKind, SiteFields, TypedRecord, columns,
};

/// Why a row was left out of the load.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("missing required field '{column}'")]
    MissingRequired { column: &'static str },
    #[error("invalid value '{value}' in required field '{column}'")]
    Invalid { column: &'static str, value: String },
}

impl SkipReason {
    /// Short label used to aggregate skip counts.
    pub fn label(&self) -> String {
        match self {
            SkipReason::MissingRequired { column } => format!("missing {column}"),
            SkipReason::Invalid { column, .. } => format!("invalid {column}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<TypedRecord>,
    pub skipped: Vec<SkippedRow>,
}

pub fn parse_row(kind: RecordKind, row: &RawRow) -> Result<TypedRecord, SkipReason> {
    match kind {
        RecordKind::Prescriptions => parse_prescription(row).map(TypedRecord::Prescription),
        RecordKind::Claims => parse_claim(row).map(TypedRecord::Claim),
    }
}

/// Parses every row, calling `on_progress(done, total)` every `interval` rows
/// and once at the end.
pub fn parse_rows(
    kind: RecordKind,
    rows: &[RawRow],
    interval: usize,
    mut on_progress: impl FnMut(usize, usize),
) -> ParsedBatch {
    let interval = interval.clamp(MIN_PROGRESS_INTERVAL, MAX_PROGRESS_INTERVAL);
    let total = rows.len();
    let mut batch = ParsedBatch {
        records: Vec::with_capacity(total),
        skipped: Vec::new(),
    };

    for (idx, row) in rows.iter().enumerate() {
        match parse_row(kind, row) {
            Ok(record) => batch.records.push(record),
            Err(reason) => {
                debug!(line = row.line(), %reason, "skipping row");
                batch.skipped.push(SkippedRow {
                    line: row.line(),
                    reason,
                });
            }
        }
        let done = idx + 1;
        if done % interval == 0 && done < total {
            on_progress(done, total);
        }
    }
    on_progress(total, total);
    batch
}

pub fn parse_prescription(row: &RawRow) -> Result<PrescriptionEvent, SkipReason> {
    let prescription_id = required(row, columns::PRESCRIPTION_ID, normalize_text)?;
    let prescribed_date = required(row, columns::DATE_PRESCRIBED, normalize_date)?;
    // Both patient names are required on prescriptions; parse_parties reads them
    // again as optional attributes of the patient entity.
    required(row, columns::PATIENT_LAST_NAME, normalize_text)?;
    required(row, columns::PATIENT_FIRST_NAME, normalize_text)?;

    Ok(PrescriptionEvent {
        line: row.line(),
        prescription_id,
        prescribed_date,
        quantity: optional(row, columns::QUANTITY, normalize_currency),
        days_supply: optional(row, columns::DAYS_SUPPLY, normalize_integer),
        refills_authorized: optional(row, columns::REFILLS_AUTHORIZED, normalize_integer),
        is_controlled: normalize_boolean(row.get(columns::CONTROLLED_SUBSTANCE)),
        is_electronic: normalize_boolean(row.get(columns::ELECTRONIC)),
        status: optional(row, columns::STATUS, normalize_text),
        parties: parse_parties(row),
    })
}

pub fn parse_claim(row: &RawRow) -> Result<ClaimEvent, SkipReason> {
    let rx_number = required(row, columns::RX_NUMBER, normalize_text)?;
    let date_written = required(row, columns::DATE_WRITTEN, normalize_date)?;
    let date_filled = required(row, columns::DATE_FILLED, normalize_date)?;
    let refill_number = required(row, columns::REFILL_NUMBER, normalize_integer)?;

    Ok(ClaimEvent {
        line: row.line(),
        rx_number,
        date_written,
        date_filled,
        refill_number,
        quantity_dispensed: optional(row, columns::QUANTITY_DISPENSED, normalize_currency),
        days_supply: optional(row, columns::DAYS_SUPPLY, normalize_integer),
        ingredient_cost: optional(row, columns::INGREDIENT_COST, normalize_currency),
        dispensing_fee: optional(row, columns::DISPENSING_FEE, normalize_currency),
        patient_pay: optional(row, columns::PATIENT_PAY, normalize_currency),
        plan_paid: optional(row, columns::PLAN_PAID, normalize_currency),
        total_paid: optional(row, columns::TOTAL_PAID, normalize_currency),
        claim_status: optional(row, columns::CLAIM_STATUS, normalize_text),
        is_340b: normalize_boolean(row.get(columns::IS_340B)),
        parties: parse_parties(row),
    })
}

fn parse_parties(row: &RawRow) -> Parties {
    Parties {
        site: SiteFields {
            organization: optional(row, columns::ORGANIZATION, normalize_text),
            location: optional(row, columns::LOCATION, normalize_text),
            address: optional(row, columns::LOCATION_ADDRESS, normalize_text),
            city: optional(row, columns::LOCATION_CITY, normalize_text),
            state: identifier(row, columns::LOCATION_STATE, canonical_state),
            zip: identifier(row, columns::LOCATION_ZIP, canonical_zip),
        },
        pharmacy: PharmacyFields {
            name: optional(row, columns::PHARMACY_NAME, normalize_text),
            npi: identifier(row, columns::PHARMACY_NPI, canonical_npi),
            nabp: identifier(row, columns::PHARMACY_NCPDP, canonical_nabp),
            address: optional(row, columns::PHARMACY_ADDRESS, normalize_text),
            city: optional(row, columns::PHARMACY_CITY, normalize_text),
            state: identifier(row, columns::PHARMACY_STATE, canonical_state),
            zip: identifier(row, columns::PHARMACY_ZIP, canonical_zip),
        },
        prescriber: PrescriberFields {
            npi: identifier(row, columns::PRESCRIBER_NPI, canonical_npi),
            dea: identifier(row, columns::PRESCRIBER_DEA, canonical_dea),
            last_name: optional(row, columns::PRESCRIBER_LAST_NAME, normalize_text),
            first_name: optional(row, columns::PRESCRIBER_FIRST_NAME, normalize_text),
            specialty: optional(row, columns::PRESCRIBER_SPECIALTY, normalize_text),
        },
        patient: PatientFields {
            external_id: optional(row, columns::PATIENT_ID, normalize_text),
            last_name: optional(row, columns::PATIENT_LAST_NAME, normalize_text),
            first_name: optional(row, columns::PATIENT_FIRST_NAME, normalize_text),
            birth_date: optional(row, columns::PATIENT_DOB, normalize_date),
            gender: identifier(row, columns::PATIENT_GENDER, canonical_gender),
            zip: identifier(row, columns::PATIENT_ZIP, canonical_zip),
        },
        drug: DrugFields {
            ndc: identifier(row, columns::NDC, canonical_ndc11),
            name: optional(row, columns::DRUG_NAME, normalize_text),
            strength: optional(row, columns::STRENGTH, normalize_text),
            dosage_form: optional(row, columns::DOSAGE_FORM, normalize_text),
        },
        plan: PlanFields {
            name: optional(row, columns::PLAN_NAME, normalize_text),
            bin: identifier(row, columns::BIN, canonical_bin),
            pcn: identifier(row, columns::PCN, canonical_code),
            group: identifier(row, columns::GROUP, canonical_code),
        },
    }
}

fn required<T>(
    row: &RawRow,
    column: &'static str,
    normalize: fn(Option<&Cell>) -> Option<T>,
) -> Result<T, SkipReason> {
    let cell = match row.get(column) {
        Some(cell) if !cell.is_blank() => cell,
        _ => return Err(SkipReason::MissingRequired { column }),
    };
    normalize(Some(cell)).ok_or_else(|| SkipReason::Invalid {
        column,
        value: cell.display_value(),
    })
}

fn optional<T>(
    row: &RawRow,
    column: &'static str,
    normalize: fn(Option<&Cell>) -> Option<T>,
) -> Option<T> {
    let cell = row.get(column).filter(|cell| !cell.is_blank())?;
    let value = normalize(Some(cell));
    if value.is_none() {
        debug!(
            line = row.line(),
            column,
            value = %cell.display_value(),
            "dropping unparseable optional value"
        );
    }
    value
}

fn identifier(
    row: &RawRow,
    column: &'static str,
    canonicalize: fn(&str) -> Option<String>,
) -> Option<String> {
    let text = optional(row, column, normalize_text)?;
    let value = canonicalize(&text);
    if value.is_none() {
        debug!(line = row.line(), column, value = %text, "dropping malformed identifier");
    }
    value
}
