use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::{
    cache::ResolutionCaches,
    entities::{
        Drug, InsurancePlan, Location, Organization, Patient, Pharmacy, Prescriber,
        ReferenceEntity,
    },
    normalize::format_date,
    records::{ClaimEvent, PrescriptionEvent, RecordKind, TypedRecord},
    store::{StoredRow, Table},
};

/// Resolved reference ids; `None` where the record carried no usable reference
/// or its entity could not be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceIds {
    pub organization_id: Option<i64>,
    pub location_id: Option<i64>,
    pub pharmacy_id: Option<i64>,
    pub prescriber_id: Option<i64>,
    pub drug_id: Option<i64>,
    pub patient_id: Option<i64>,
    pub insurance_plan_id: Option<i64>,
}

impl ReferenceIds {
    pub fn resolve(record: &TypedRecord, caches: &ResolutionCaches) -> Self {
        Self {
            organization_id: resolved_id::<Organization>(record, caches),
            location_id: resolved_id::<Location>(record, caches),
            pharmacy_id: resolved_id::<Pharmacy>(record, caches),
            prescriber_id: resolved_id::<Prescriber>(record, caches),
            drug_id: resolved_id::<Drug>(record, caches),
            patient_id: resolved_id::<Patient>(record, caches),
            insurance_plan_id: resolved_id::<InsurancePlan>(record, caches),
        }
    }

    fn write_to(&self, row: &mut StoredRow) {
        put(row, "organization_id", self.organization_id);
        put(row, "location_id", self.location_id);
        put(row, "pharmacy_id", self.pharmacy_id);
        put(row, "prescriber_id", self.prescriber_id);
        put(row, "drug_id", self.drug_id);
        put(row, "patient_id", self.patient_id);
        put(row, "insurance_plan_id", self.insurance_plan_id);
    }
}

pub fn resolved_id<E: ReferenceEntity>(
    record: &TypedRecord,
    caches: &ResolutionCaches,
) -> Option<i64> {
    let key = E::from_record(record, caches)?.natural_key()?;
    caches.lookup(E::KIND, &key)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrescriptionRecord {
    pub line: usize,
    pub prescription_id: String,
    pub prescribed_date: NaiveDate,
    pub quantity: Option<Decimal>,
    pub days_supply: Option<i64>,
    pub refills_authorized: Option<i64>,
    pub is_controlled: bool,
    pub is_electronic: bool,
    pub status: Option<String>,
    pub refs: ReferenceIds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
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
    pub refs: ReferenceIds,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactRecord {
    Prescription(PrescriptionRecord),
    Claim(ClaimRecord),
}

impl FactRecord {
    pub fn line(&self) -> usize {
        match self {
            FactRecord::Prescription(fact) => fact.line,
            FactRecord::Claim(fact) => fact.line,
        }
    }

    pub fn refs(&self) -> &ReferenceIds {
        match self {
            FactRecord::Prescription(fact) => &fact.refs,
            FactRecord::Claim(fact) => &fact.refs,
        }
    }

    /// Decimals are stored as exact strings and dates as `YYYY-MM-DD`.
    pub fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        match self {
            FactRecord::Prescription(fact) => {
                put(&mut row, "prescription_id", fact.prescription_id.clone());
                put(&mut row, "prescribed_date", format_date(fact.prescribed_date));
                put(&mut row, "quantity", decimal(fact.quantity));
                put(&mut row, "days_supply", fact.days_supply);
                put(&mut row, "refills_authorized", fact.refills_authorized);
                put(&mut row, "is_controlled", fact.is_controlled);
                put(&mut row, "is_electronic", fact.is_electronic);
                put(&mut row, "status", fact.status.clone());
                fact.refs.write_to(&mut row);
            }
            FactRecord::Claim(fact) => {
                put(&mut row, "rx_number", fact.rx_number.clone());
                put(&mut row, "date_written", format_date(fact.date_written));
                put(&mut row, "date_filled", format_date(fact.date_filled));
                put(&mut row, "refill_number", fact.refill_number);
                put(&mut row, "quantity_dispensed", decimal(fact.quantity_dispensed));
                put(&mut row, "days_supply", fact.days_supply);
                put(&mut row, "ingredient_cost", decimal(fact.ingredient_cost));
                put(&mut row, "dispensing_fee", decimal(fact.dispensing_fee));
                put(&mut row, "patient_pay", decimal(fact.patient_pay));
                put(&mut row, "plan_paid", decimal(fact.plan_paid));
                put(&mut row, "total_paid", decimal(fact.total_paid));
                put(&mut row, "claim_status", fact.claim_status.clone());
                put(&mut row, "is_340b", fact.is_340b);
                fact.refs.write_to(&mut row);
            }
        }
        row
    }
}

pub fn fact_table(kind: RecordKind) -> Table {
    match kind {
        RecordKind::Prescriptions => Table::Prescriptions,
        RecordKind::Claims => Table::Claims,
    }
}

pub fn build_fact(record: &TypedRecord, caches: &ResolutionCaches) -> FactRecord {
    let refs = ReferenceIds::resolve(record, caches);
    match record {
        TypedRecord::Prescription(event) => FactRecord::Prescription(prescription(event, refs)),
        TypedRecord::Claim(event) => FactRecord::Claim(claim(event, refs)),
    }
}

fn prescription(event: &PrescriptionEvent, refs: ReferenceIds) -> PrescriptionRecord {
    PrescriptionRecord {
        line: event.line,
        prescription_id: event.prescription_id.clone(),
        prescribed_date: event.prescribed_date,
        quantity: event.quantity,
        days_supply: event.days_supply,
        refills_authorized: event.refills_authorized,
        is_controlled: event.is_controlled,
        is_electronic: event.is_electronic,
        status: event.status.clone(),
        refs,
    }
}

fn claim(event: &ClaimEvent, refs: ReferenceIds) -> ClaimRecord {
    ClaimRecord {
        line: event.line,
        rx_number: event.rx_number.clone(),
        date_written: event.date_written,
        date_filled: event.date_filled,
        refill_number: event.refill_number,
        quantity_dispensed: event.quantity_dispensed,
        days_supply: event.days_supply,
        ingredient_cost: event.ingredient_cost,
        dispensing_fee: event.dispensing_fee,
        patient_pay: event.patient_pay,
        plan_paid: event.plan_paid,
        total_paid: event.total_paid,
        claim_status: event.claim_status.clone(),
        is_340b: event.is_340b,
        refs,
    }
}

fn decimal(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

fn put(row: &mut StoredRow, column: &str, value: impl Into<Value>) {
    row.insert(column.to_string(), value.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResolutionCache;
    use crate::entities::EntityKind;
    use crate::records::Parties;
    use serde_json::json;
    use std::str::FromStr;

    fn prescription_event(parties: Parties) -> TypedRecord {
        TypedRecord::Prescription(PrescriptionEvent {
            line: 4,
            prescription_id: "P-100".to_string(),
            prescribed_date: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
            quantity: Some(Decimal::from_str("30.50").unwrap()),
            days_supply: Some(30),
            refills_authorized: None,
            is_controlled: true,
            is_electronic: false,
            status: None,
            parties,
        })
    }

    #[test]
    fn references_resolve_through_caches_and_default_to_null() {
        let mut parties = Parties::default();
        parties.pharmacy.name = Some("Main St Pharmacy".to_string());
        parties.pharmacy.npi = Some("1234567890".to_string());
        parties.drug.ndc = Some("00002143380".to_string());
        let record = prescription_event(parties);

        let mut pharmacies = ResolutionCache::new(EntityKind::Pharmacy);
        pharmacies.insert("npi:1234567890".to_string(), 11);
        let mut caches = ResolutionCaches::default();
        caches.install(pharmacies);

        let fact = build_fact(&record, &caches);
        assert_eq!(fact.refs().pharmacy_id, Some(11));
        // The drug is present but its kind was never resolved.
        assert_eq!(fact.refs().drug_id, None);
        assert_eq!(fact.refs().patient_id, None);
        assert_eq!(fact.line(), 4);
    }

    #[test]
    fn rows_carry_canonical_values() {
        let fact = build_fact(
            &prescription_event(Parties::default()),
            &ResolutionCaches::default(),
        );
        let row = fact.to_row();
        assert_eq!(row["prescription_id"], json!("P-100"));
        assert_eq!(row["prescribed_date"], json!("2024-03-09"));
        assert_eq!(row["quantity"], json!("30.50"));
        assert_eq!(row["is_controlled"], json!(true));
        assert_eq!(row["pharmacy_id"], Value::Null);
    }
}
