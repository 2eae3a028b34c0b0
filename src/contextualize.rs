use log::*;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("{subject} failed validation: {}", .failures.join("; "))]
pub struct ValidationError {
    pub subject: String,
    pub failures: Vec<String>,
}

/// Accumulates requirements so every failure is reported, not just the first.
pub struct Validation {
    name: String,
    failures: Vec<String>,
}

impl Validation {
    pub fn new(name: &str) -> Self {
        debug!("Validating {}.", name);

        Self {
            name: name.to_owned(),
            failures: Vec::new(),
        }
    }

    pub fn require(&mut self, name: &str, state: bool) -> bool {
        if state {
            debug!("Requirement satisified: {}", name);
        } else {
            error!("{}: requirement failed: {}", Self::capitolize(self.name.clone()), name);
            self.failures.push(name.to_owned());
        }
        state
    }

    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn validate(self) -> Result<(), ValidationError> {
        if self.is_valid() {
            debug!("Fully validated: {}", self.name);
            Ok(())
        } else {
            Err(ValidationError {
                subject: Self::capitolize(self.name),
                failures: self.failures,
            })
        }
    }

    fn capitolize(mut string: String) -> String {
        if let Some(c) = string.get_mut(0..1) {
            c.make_ascii_uppercase();
        }
        string
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_failure() {
        let mut validation = Validation::new("job backup");
        assert!(validation.require("source dataset is set", true));
        assert!(!validation.require("destination dataset is set", false));
        assert!(!validation.require("snapshot prefix is set", false));

        let error = validation.validate().unwrap_err();
        assert_eq!(error.subject, "Job backup");
        assert_eq!(
            error.to_string(),
            "Job backup failed validation: destination dataset is set; snapshot prefix is set"
        );
    }

    #[test]
    fn passes_when_all_requirements_hold() {
        let mut validation = Validation::new("hosts");
        validation.require("source reachable", true);
        assert!(validation.validate().is_ok());
    }
}
