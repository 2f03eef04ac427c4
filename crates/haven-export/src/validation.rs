use crate::job::ExportJob;
use crate::materialize::{Materialized, PERSONAL_ID_COLUMN};

pub const DEFAULT_REQUIRED_SECTIONS: [&str; 2] = ["Client", "Enrollment"];

/// Checks run in the VALIDATING phase. An empty result means the job may
/// be formatted and packaged.
pub trait ExportValidator: Send + Sync {
    fn validate(&self, job: &ExportJob, data: &Materialized) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct RequiredSectionsValidator {
    required: Vec<String>,
}

impl RequiredSectionsValidator {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

impl Default for RequiredSectionsValidator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_SECTIONS.iter().map(|s| s.to_string()).collect())
    }
}

impl ExportValidator for RequiredSectionsValidator {
    fn validate(&self, _job: &ExportJob, data: &Materialized) -> Vec<String> {
        self.required
            .iter()
            .filter(|section| !data.has_section(section))
            .map(|section| format!("Missing required section: {section}"))
            .collect()
    }
}

/// Every row must carry a non-empty `PersonalID`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersonalIdValidator;

impl ExportValidator for PersonalIdValidator {
    fn validate(&self, _job: &ExportJob, data: &Materialized) -> Vec<String> {
        let mut errors = Vec::new();
        for (section, table) in &data.tables {
            let Some(col) = table.columns.iter().position(|c| c == PERSONAL_ID_COLUMN) else {
                errors.push(format!("Section {section} has no {PERSONAL_ID_COLUMN} column"));
                continue;
            };
            let blank = table.rows.iter().filter(|r| r[col].trim().is_empty()).count();
            if blank > 0 {
                errors.push(format!(
                    "Section {section} has {blank} rows without {PERSONAL_ID_COLUMN}"
                ));
            }
        }
        errors
    }
}

/// Runs each validator in order and concatenates their errors.
#[derive(Default)]
pub struct CompositeValidator {
    validators: Vec<Box<dyn ExportValidator>>,
}

impl CompositeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl ExportValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Required sections from `required` plus the `PersonalID` check.
    pub fn standard(required: Vec<String>) -> Self {
        Self::new()
            .with(RequiredSectionsValidator::new(required))
            .with(PersonalIdValidator)
    }
}

impl ExportValidator for CompositeValidator {
    fn validate(&self, job: &ExportJob, data: &Materialized) -> Vec<String> {
        self.validators
            .iter()
            .flat_map(|v| v.validate(job, data))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::NormalizedTable;
    use crate::job::{ExportFilters, ExportType, ReportingPeriod};
    use chrono::NaiveDate;
    use haven_core::ActorId;

    fn make_job() -> ExportJob {
        let period = ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )
        .unwrap();
        ExportJob::queue(
            ExportType::HmisCsv,
            period,
            ExportFilters::default(),
            ActorId::new("alice"),
            "test",
        )
        .unwrap()
        .0
    }

    fn make_data(sections: &[&str]) -> Materialized {
        let mut data = Materialized::default();
        for s in sections {
            let mut table = NormalizedTable::new(vec![PERSONAL_ID_COLUMN.to_string()]);
            table.push_row(vec!["X".into()]).unwrap();
            data.tables.insert(s.to_string(), table);
        }
        data
    }

    #[test]
    fn test_missing_both_sections() {
        let errors = RequiredSectionsValidator::default().validate(&make_job(), &make_data(&[]));
        assert_eq!(
            errors,
            vec![
                "Missing required section: Client".to_string(),
                "Missing required section: Enrollment".to_string(),
            ]
        );
    }

    #[test]
    fn test_all_sections_present() {
        let errors = RequiredSectionsValidator::default()
            .validate(&make_job(), &make_data(&["Client", "Enrollment", "Exit"]));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_blank_personal_id() {
        let mut data = make_data(&["Client"]);
        data.tables
            .get_mut("Client")
            .unwrap()
            .push_row(vec![" ".into()])
            .unwrap();
        let errors = PersonalIdValidator.validate(&make_job(), &data);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_composite_concatenates() {
        let v = CompositeValidator::standard(vec!["Client".into(), "Exit".into()]);
        let errors = v.validate(&make_job(), &make_data(&["Enrollment"]));
        assert_eq!(errors.len(), 2);
    }
}
