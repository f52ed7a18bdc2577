//! Reference entities and their natural keys.
//!
//! Every kind has exactly one identity function. It is fed either the
//! attributes parsed from an input row or the columns of a stored row, so the
//! key computed for a candidate and the key recomputed from what the store
//! returned always agree.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::{
    cache::ResolutionCaches,
    normalize::{
        canonical_bin, canonical_code, canonical_dea, canonical_name, canonical_nabp,
        canonical_ndc11, canonical_npi, format_date, normalize_date,
    },
    raw_row::Cell,
    records::TypedRecord,
    store::{StoredRow, Table, row_i64, row_text},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Pharmacy,
    Prescriber,
    Location,
    Drug,
    Patient,
    InsurancePlan,
}

/// Kinds in the order they are resolved. A kind appears after everything it depends on.
pub const RESOLUTION_ORDER: [EntityKind; 7] = [
    EntityKind::Organization,
    EntityKind::Pharmacy,
    EntityKind::Prescriber,
    EntityKind::Location,
    EntityKind::Drug,
    EntityKind::Patient,
    EntityKind::InsurancePlan,
];

impl EntityKind {
    pub fn table(self) -> Table {
        match self {
            EntityKind::Organization => Table::Organizations,
            EntityKind::Pharmacy => Table::Pharmacies,
            EntityKind::Prescriber => Table::Prescribers,
            EntityKind::Location => Table::Locations,
            EntityKind::Drug => Table::Drugs,
            EntityKind::Patient => Table::Patients,
            EntityKind::InsurancePlan => Table::InsurancePlans,
        }
    }

    /// Kinds whose resolved ids feed this kind's natural key.
    pub fn depends_on(self) -> &'static [EntityKind] {
        match self {
            EntityKind::Location => &[EntityKind::Organization],
            _ => &[],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Pharmacy => "pharmacy",
            EntityKind::Prescriber => "prescriber",
            EntityKind::Location => "location",
            EntityKind::Drug => "drug",
            EntityKind::Patient => "patient",
            EntityKind::InsurancePlan => "insurance_plan",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One identifying attribute with its canonical value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Probe {
    pub attr: &'static str,
    pub value: String,
}

impl Probe {
    pub fn key(&self) -> String {
        format!("{}:{}", self.attr, self.value)
    }
}

pub trait ReferenceEntity: Clone + fmt::Debug + Sized {
    const KIND: EntityKind;
    /// Identifying attributes, highest priority first.
    const IDENTIFIERS: &'static [&'static str];

    /// The entity a record refers to, if the record carries enough to create one.
    fn from_record(record: &TypedRecord, caches: &ResolutionCaches) -> Option<Self>;

    /// Present identifying attributes in priority order.
    fn probes(&self) -> Vec<Probe>;

    fn probes_from_row(row: &StoredRow) -> Vec<Probe>;

    /// Fills attributes this entity lacks from another sighting of the same entity.
    fn absorb(&mut self, other: &Self);

    fn to_row(&self) -> StoredRow;

    fn natural_key(&self) -> Option<String> {
        self.probes().first().map(Probe::key)
    }
}

fn push_probe(probes: &mut Vec<Probe>, attr: &'static str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        probes.push(Probe { attr, value });
    }
}

fn name_key(name: Option<&str>) -> Option<String> {
    name.map(canonical_name).filter(|n| !n.is_empty())
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

fn put(row: &mut StoredRow, column: &str, value: impl Into<Value>) {
    row.insert(column.to_string(), value.into());
}

#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    pub name: String,
}

fn organization_identity(name: Option<&str>) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(&mut probes, "name", name_key(name));
    probes
}

impl ReferenceEntity for Organization {
    const KIND: EntityKind = EntityKind::Organization;
    const IDENTIFIERS: &'static [&'static str] = &["name"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let name = record.parties().site.organization.clone()?;
        Some(Self { name })
    }

    fn probes(&self) -> Vec<Probe> {
        organization_identity(Some(&self.name))
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        organization_identity(row_text(row, "name").as_deref())
    }

    fn absorb(&mut self, _other: &Self) {}

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "name", self.name.clone());
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pharmacy {
    pub name: String,
    pub npi: Option<String>,
    pub nabp: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

fn pharmacy_identity(npi: Option<&str>, nabp: Option<&str>, name: Option<&str>) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(&mut probes, "npi", npi.and_then(canonical_npi));
    push_probe(&mut probes, "nabp", nabp.and_then(canonical_nabp));
    push_probe(&mut probes, "name", name_key(name));
    probes
}

impl ReferenceEntity for Pharmacy {
    const KIND: EntityKind = EntityKind::Pharmacy;
    const IDENTIFIERS: &'static [&'static str] = &["npi", "nabp", "name"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let fields = &record.parties().pharmacy;
        Some(Self {
            name: fields.name.clone()?,
            npi: fields.npi.clone(),
            nabp: fields.nabp.clone(),
            address: fields.address.clone(),
            city: fields.city.clone(),
            state: fields.state.clone(),
            zip: fields.zip.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        pharmacy_identity(
            self.npi.as_deref(),
            self.nabp.as_deref(),
            Some(&self.name),
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        pharmacy_identity(
            row_text(row, "npi").as_deref(),
            row_text(row, "nabp").as_deref(),
            row_text(row, "name").as_deref(),
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.npi, &other.npi);
        fill(&mut self.nabp, &other.nabp);
        fill(&mut self.address, &other.address);
        fill(&mut self.city, &other.city);
        fill(&mut self.state, &other.state);
        fill(&mut self.zip, &other.zip);
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "name", self.name.clone());
        put(&mut row, "npi", self.npi.clone());
        put(&mut row, "nabp", self.nabp.clone());
        put(&mut row, "address", self.address.clone());
        put(&mut row, "city", self.city.clone());
        put(&mut row, "state", self.state.clone());
        put(&mut row, "zip", self.zip.clone());
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prescriber {
    pub npi: Option<String>,
    pub dea: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub specialty: Option<String>,
}

fn prescriber_identity(
    npi: Option<&str>,
    dea: Option<&str>,
    last_name: Option<&str>,
    first_name: Option<&str>,
) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(&mut probes, "npi", npi.and_then(canonical_npi));
    push_probe(&mut probes, "dea", dea.and_then(canonical_dea));
    push_probe(
        &mut probes,
        "name",
        name_key(last_name).map(|last| {
            format!("{last}|{}", name_key(first_name).unwrap_or_default())
        }),
    );
    probes
}

impl ReferenceEntity for Prescriber {
    const KIND: EntityKind = EntityKind::Prescriber;
    const IDENTIFIERS: &'static [&'static str] = &["npi", "dea", "name"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let fields = &record.parties().prescriber;
        if fields.npi.is_none() && fields.last_name.is_none() {
            return None;
        }
        Some(Self {
            npi: fields.npi.clone(),
            dea: fields.dea.clone(),
            last_name: fields.last_name.clone(),
            first_name: fields.first_name.clone(),
            specialty: fields.specialty.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        prescriber_identity(
            self.npi.as_deref(),
            self.dea.as_deref(),
            self.last_name.as_deref(),
            self.first_name.as_deref(),
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        prescriber_identity(
            row_text(row, "npi").as_deref(),
            row_text(row, "dea").as_deref(),
            row_text(row, "last_name").as_deref(),
            row_text(row, "first_name").as_deref(),
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.npi, &other.npi);
        fill(&mut self.dea, &other.dea);
        if self.last_name.is_none() {
            self.last_name.clone_from(&other.last_name);
            self.first_name.clone_from(&other.first_name);
        }
        fill(&mut self.specialty, &other.specialty);
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "npi", self.npi.clone());
        put(&mut row, "dea", self.dea.clone());
        put(&mut row, "last_name", self.last_name.clone());
        put(&mut row, "first_name", self.first_name.clone());
        put(&mut row, "specialty", self.specialty.clone());
        row
    }
}

/// A dispensing or prescribing site, scoped to its organization.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub organization_id: Option<i64>,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

fn location_identity(
    organization_id: Option<i64>,
    name: Option<&str>,
    address: Option<&str>,
) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(
        &mut probes,
        "site",
        name_key(name).map(|name| {
            format!(
                "{}|{name}|{}",
                organization_id.map(|id| id.to_string()).unwrap_or_default(),
                name_key(address).unwrap_or_default()
            )
        }),
    );
    probes
}

impl ReferenceEntity for Location {
    const KIND: EntityKind = EntityKind::Location;
    const IDENTIFIERS: &'static [&'static str] = &["site"];

    fn from_record(record: &TypedRecord, caches: &ResolutionCaches) -> Option<Self> {
        let site = &record.parties().site;
        // A named organization without an id would key the site differently on the next run.
        let organization_id = match Organization::from_record(record, caches) {
            Some(org) => Some(caches.lookup(EntityKind::Organization, &org.natural_key()?)?),
            None => None,
        };
        Some(Self {
            organization_id,
            name: site.location.clone()?,
            address: site.address.clone(),
            city: site.city.clone(),
            state: site.state.clone(),
            zip: site.zip.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        location_identity(
            self.organization_id,
            Some(&self.name),
            self.address.as_deref(),
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        location_identity(
            row_i64(row, "organization_id"),
            row_text(row, "name").as_deref(),
            row_text(row, "address").as_deref(),
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.city, &other.city);
        fill(&mut self.state, &other.state);
        fill(&mut self.zip, &other.zip);
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "organization_id", self.organization_id);
        put(&mut row, "name", self.name.clone());
        put(&mut row, "address", self.address.clone());
        put(&mut row, "city", self.city.clone());
        put(&mut row, "state", self.state.clone());
        put(&mut row, "zip", self.zip.clone());
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Drug {
    pub ndc: Option<String>,
    pub name: Option<String>,
    pub strength: Option<String>,
    pub dosage_form: Option<String>,
}

fn drug_identity(ndc: Option<&str>, name: Option<&str>, strength: Option<&str>) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(&mut probes, "ndc", ndc.and_then(canonical_ndc11));
    push_probe(
        &mut probes,
        "name",
        name_key(name)
            .map(|name| format!("{name}|{}", name_key(strength).unwrap_or_default())),
    );
    probes
}

impl ReferenceEntity for Drug {
    const KIND: EntityKind = EntityKind::Drug;
    const IDENTIFIERS: &'static [&'static str] = &["ndc", "name"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let fields = &record.parties().drug;
        if fields.ndc.is_none() && fields.name.is_none() {
            return None;
        }
        Some(Self {
            ndc: fields.ndc.clone(),
            name: fields.name.clone(),
            strength: fields.strength.clone(),
            dosage_form: fields.dosage_form.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        drug_identity(
            self.ndc.as_deref(),
            self.name.as_deref(),
            self.strength.as_deref(),
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        drug_identity(
            row_text(row, "ndc").as_deref(),
            row_text(row, "name").as_deref(),
            row_text(row, "strength").as_deref(),
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.ndc, &other.ndc);
        if self.name.is_none() {
            self.name.clone_from(&other.name);
            self.strength.clone_from(&other.strength);
        }
        fill(&mut self.dosage_form, &other.dosage_form);
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "ndc", self.ndc.clone());
        put(&mut row, "name", self.name.clone());
        put(&mut row, "strength", self.strength.clone());
        put(&mut row, "dosage_form", self.dosage_form.clone());
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub external_id: Option<String>,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub zip: Option<String>,
}

fn patient_identity(
    external_id: Option<&str>,
    last_name: Option<&str>,
    first_name: Option<&str>,
    birth_date: Option<NaiveDate>,
) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(&mut probes, "mrn", external_id.and_then(canonical_code));
    let identity = match (name_key(last_name), name_key(first_name)) {
        (Some(last), Some(first)) => Some(format!(
            "{last}|{first}|{}",
            birth_date.map(format_date).unwrap_or_default()
        )),
        _ => None,
    };
    push_probe(&mut probes, "identity", identity);
    probes
}

impl ReferenceEntity for Patient {
    const KIND: EntityKind = EntityKind::Patient;
    const IDENTIFIERS: &'static [&'static str] = &["mrn", "identity"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let fields = &record.parties().patient;
        let named = fields.last_name.is_some() && fields.first_name.is_some();
        if fields.external_id.is_none() && !named {
            return None;
        }
        Some(Self {
            external_id: fields.external_id.clone(),
            last_name: fields.last_name.clone(),
            first_name: fields.first_name.clone(),
            birth_date: fields.birth_date,
            gender: fields.gender.clone(),
            zip: fields.zip.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        patient_identity(
            self.external_id.as_deref(),
            self.last_name.as_deref(),
            self.first_name.as_deref(),
            self.birth_date,
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        let birth_date =
            row_text(row, "birth_date").and_then(|text| normalize_date(Some(&Cell::Text(text))));
        patient_identity(
            row_text(row, "external_id").as_deref(),
            row_text(row, "last_name").as_deref(),
            row_text(row, "first_name").as_deref(),
            birth_date,
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.external_id, &other.external_id);
        fill(&mut self.gender, &other.gender);
        fill(&mut self.zip, &other.zip);
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "external_id", self.external_id.clone());
        put(&mut row, "last_name", self.last_name.clone());
        put(&mut row, "first_name", self.first_name.clone());
        put(&mut row, "birth_date", self.birth_date.map(format_date));
        put(&mut row, "gender", self.gender.clone());
        put(&mut row, "zip", self.zip.clone());
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsurancePlan {
    pub name: Option<String>,
    pub bin: Option<String>,
    pub pcn: Option<String>,
    pub group: Option<String>,
}

fn plan_identity(
    bin: Option<&str>,
    pcn: Option<&str>,
    group: Option<&str>,
    name: Option<&str>,
) -> Vec<Probe> {
    let mut probes = Vec::new();
    push_probe(
        &mut probes,
        "bin_pcn_group",
        bin.and_then(canonical_bin).map(|bin| {
            format!(
                "{bin}|{}|{}",
                pcn.and_then(canonical_code).unwrap_or_default(),
                group.and_then(canonical_code).unwrap_or_default()
            )
        }),
    );
    push_probe(&mut probes, "name", name_key(name));
    probes
}

impl ReferenceEntity for InsurancePlan {
    const KIND: EntityKind = EntityKind::InsurancePlan;
    const IDENTIFIERS: &'static [&'static str] = &["bin_pcn_group", "name"];

    fn from_record(record: &TypedRecord, _caches: &ResolutionCaches) -> Option<Self> {
        let fields = &record.parties().plan;
        if fields.bin.is_none() && fields.name.is_none() {
            return None;
        }
        Some(Self {
            name: fields.name.clone(),
            bin: fields.bin.clone(),
            pcn: fields.pcn.clone(),
            group: fields.group.clone(),
        })
    }

    fn probes(&self) -> Vec<Probe> {
        plan_identity(
            self.bin.as_deref(),
            self.pcn.as_deref(),
            self.group.as_deref(),
            self.name.as_deref(),
        )
    }

    fn probes_from_row(row: &StoredRow) -> Vec<Probe> {
        plan_identity(
            row_text(row, "bin").as_deref(),
            row_text(row, "pcn").as_deref(),
            row_text(row, "group_number").as_deref(),
            row_text(row, "name").as_deref(),
        )
    }

    fn absorb(&mut self, other: &Self) {
        fill(&mut self.name, &other.name);
        if self.bin.is_none() {
            self.bin.clone_from(&other.bin);
            self.pcn.clone_from(&other.pcn);
            self.group.clone_from(&other.group);
        }
    }

    fn to_row(&self) -> StoredRow {
        let mut row = StoredRow::new();
        put(&mut row, "name", self.name.clone());
        put(&mut row, "bin", self.bin.clone());
        put(&mut row, "pcn", self.pcn.clone());
        put(&mut row, "group_number", self.group.clone());
        row
    }
}
