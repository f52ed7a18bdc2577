use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which source schema a file follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Prescriptions,
    Claims,
}

impl RecordKind {
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            RecordKind::Prescriptions => columns::PRESCRIPTION_REQUIRED,
            RecordKind::Claims => columns::CLAIM_REQUIRED,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Prescriptions => f.write_str("prescriptions"),
            RecordKind::Claims => f.write_str("claims"),
        }
    }
}

/// Source column names. Matching is case-sensitive.
pub mod columns {
    pub const PRESCRIPTION_ID: &str = "Prescription ID";
    pub const DATE_PRESCRIBED: &str = "Date Prescribed";
    pub const QUANTITY: &str = "Quantity";
    pub const REFILLS_AUTHORIZED: &str = "Refills Authorized";
    pub const CONTROLLED_SUBSTANCE: &str = "Controlled Substance";
    pub const ELECTRONIC: &str = "Electronic";
    pub const STATUS: &str = "Status";

    pub const RX_NUMBER: &str = "Rx Number";
    pub const DATE_WRITTEN: &str = "Date Written";
    pub const DATE_FILLED: &str = "Date Filled";
    pub const REFILL_NUMBER: &str = "Refill Number";
    pub const QUANTITY_DISPENSED: &str = "Quantity Dispensed";
    pub const INGREDIENT_COST: &str = "Ingredient Cost";
    pub const DISPENSING_FEE: &str = "Dispensing Fee";
    pub const PATIENT_PAY: &str = "Patient Pay";
    pub const PLAN_PAID: &str = "Plan Paid";
    pub const TOTAL_PAID: &str = "Total Paid";
    pub const CLAIM_STATUS: &str = "Claim Status";
    pub const IS_340B: &str = "340B";

    pub const DAYS_SUPPLY: &str = "Days Supply";

    pub const ORGANIZATION: &str = "Organization";
    pub const LOCATION: &str = "Location";
    pub const LOCATION_ADDRESS: &str = "Location Address";
    pub const LOCATION_CITY: &str = "Location City";
    pub const LOCATION_STATE: &str = "Location State";
    pub const LOCATION_ZIP: &str = "Location Zip";

    pub const PHARMACY_NAME: &str = "Pharmacy Name";
    pub const PHARMACY_NPI: &str = "Pharmacy NPI";
    pub const PHARMACY_NCPDP: &str = "Pharmacy NCPDP";
    pub const PHARMACY_ADDRESS: &str = "Pharmacy Address";
    pub const PHARMACY_CITY: &str = "Pharmacy City";
    pub const PHARMACY_STATE: &str = "Pharmacy State";
    pub const PHARMACY_ZIP: &str = "Pharmacy Zip";

    pub const PRESCRIBER_NPI: &str = "Prescriber NPI";
    pub const PRESCRIBER_DEA: &str = "Prescriber DEA";
    pub const PRESCRIBER_LAST_NAME: &str = "Prescriber Last Name";
    pub const PRESCRIBER_FIRST_NAME: &str = "Prescriber First Name";
    pub const PRESCRIBER_SPECIALTY: &str = "Prescriber Specialty";

    pub const PATIENT_ID: &str = "Patient ID";
    pub const PATIENT_LAST_NAME: &str = "Patient Last Name";
    pub const PATIENT_FIRST_NAME: &str = "Patient First Name";
    pub const PATIENT_DOB: &str = "Patient DOB";
    pub const PATIENT_GENDER: &str = "Patient Gender";
    pub const PATIENT_ZIP: &str = "Patient Zip";

    pub const NDC: &str = "NDC";
    pub const DRUG_NAME: &str = "Drug Name";
    pub const STRENGTH: &str = "Strength";
    pub const DOSAGE_FORM: &str = "Dosage Form";

    pub const PLAN_NAME: &str = "Plan Name";
    pub const BIN: &str = "BIN";
    pub const PCN: &str = "PCN";
    pub const GROUP: &str = "Group";

    pub const PRESCRIPTION_REQUIRED: &[&str] = &[
        PRESCRIPTION_ID,
        DATE_PRESCRIBED,
        PATIENT_LAST_NAME,
        PATIENT_FIRST_NAME,
    ];
    pub const CLAIM_REQUIRED: &[&str] = &[RX_NUMBER, DATE_WRITTEN, DATE_FILLED, REFILL_NUMBER];
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteFields {
    pub organization: Option<String>,
    pub location: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PharmacyFields {
    pub name: Option<String>,
    pub npi: Option<String>,
    pub nabp: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrescriberFields {
    pub npi: Option<String>,
    pub dea: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientFields {
    pub external_id: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrugFields {
    pub ndc: Option<String>,
    pub name: Option<String>,
    pub strength: Option<String>,
    pub dosage_form: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanFields {
    pub name: Option<String>,
    pub bin: Option<String>,
    pub pcn: Option<String>,
    pub group: Option<String>,
}

/// Reference attributes shared by both source schemas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parties {
    pub site: SiteFields,
    pub pharmacy: PharmacyFields,
    pub prescriber: PrescriberFields,
    pub patient: PatientFields,
    pub drug: DrugFields,
    pub plan: PlanFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrescriptionEvent {
    pub line: usize,
    pub prescription_id: String,
    pub prescribed_date: NaiveDate,
    pub quantity: Option<Decimal>,
    pub days_supply: Option<i64>,
    pub refills_authorized: Option<i64>,
    pub is_controlled: bool,
    pub is_electronic: bool,
    pub status: Option<String>,
    pub parties: Parties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEvent {
    pub line: usize,
    pub rx_number: String,
    pub date_written: NaiveDate,
    pub date_filled: NaiveDate,
    pub refill_number: i64,
    pub quantity_dispensed: Option<Decimal>,
    pub days_supply: Option<i64>,
    pub ingredient_cost: Option<Decimal>,
    pub dispensing_fee: Option<Decimal>,
    pub patient_pay: Option<Decimal>,
    pub plan_paid: Option<Decimal>,
    pub total_paid: Option<Decimal>,
    pub claim_status: Option<String>,
    pub is_340b: bool,
    pub parties: Parties,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedRecord {
    Prescription(PrescriptionEvent),
    Claim(ClaimEvent),
}

impl TypedRecord {
    pub fn parties(&self) -> &Parties {
        match self {
            TypedRecord::Prescription(event) => &event.parties,
            TypedRecord::Claim(event) => &event.parties,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            TypedRecord::Prescription(event) => event.line,
            TypedRecord::Claim(event) => event.line,
        }
    }
}
