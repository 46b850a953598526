//! Failure diagnosis for operators.
//!
//! Scans raw tool output for known causes and appends a remediation block.
//! Rules are ordered: capability-specific IAM failures come before the generic
//! permission rule, and the first match wins. Nothing here feeds back into
//! control flow.

/// A known failure cause and what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnosis {
    pub cause: &'static str,
    pub needle: &'static str,
    pub remediation: &'static str,
}

const RULES: &[Diagnosis] = &[
    Diagnosis {
        cause: "secret-manager-access",
        needle: "secretmanager.versions.access",
        remediation: "\n\nSOLUTION: Grant Secret Manager Admin role to service account.\n\
            Command: gcloud projects add-iam-policy-binding PROJECT_ID \
            --member='serviceAccount:SA_EMAIL' --role='roles/secretmanager.admin'",
    },
    Diagnosis {
        cause: "cloudsql-create",
        needle: "cloudsql.instances.create",
        remediation: "\n\nSOLUTION: Grant Cloud SQL Admin role to service account.\n\
            Command: gcloud projects add-iam-policy-binding PROJECT_ID \
            --member='serviceAccount:SA_EMAIL' --role='roles/cloudsql.admin'",
    },
    Diagnosis {
        cause: "storage-bucket-create",
        needle: "storage.buckets.create",
        remediation: "\n\nSOLUTION: Grant Storage Admin role to service account.\n\
            Command: gcloud projects add-iam-policy-binding PROJECT_ID \
            --member='serviceAccount:SA_EMAIL' --role='roles/storage.admin'",
    },
    Diagnosis {
        cause: "firewall-create",
        needle: "compute.firewalls.create",
        remediation: "\n\nSOLUTION: Grant Compute Network Admin role to service account.\n\
            Command: gcloud projects add-iam-policy-binding PROJECT_ID \
            --member='serviceAccount:SA_EMAIL' --role='roles/compute.networkAdmin'",
    },
    Diagnosis {
        cause: "already-exists",
        needle: "already exists",
        remediation: "\n\nSOLUTION: Resource already exists from previous deployment.\n\
            Either destroy the existing resource or use a different name/region.",
    },
    Diagnosis {
        cause: "permission-denied",
        needle: "Permission denied",
        remediation: "\n\nSOLUTION: Service account lacks required GCP permissions.\n\
            Check service account roles and permissions.",
    },
    Diagnosis {
        cause: "timeout",
        needle: "timed out after",
        remediation: "\n\nSOLUTION: The provisioning step exceeded its time limit.\n\
            Partially created resources may exist: destroy the tenant's infrastructure, \
            then resubmit. Raise the step timeout if the region is slow to provision.",
    },
];

/// First matching rule for the raw failure text, if any.
pub fn diagnose(raw: &str) -> Option<&'static Diagnosis> {
    RULES.iter().find(|rule| raw.contains(rule.needle))
}

/// Raw message with the remediation block of the first matching rule
/// appended, or the raw message unchanged.
pub fn classify(raw: &str) -> String {
    match diagnose(raw) {
        Some(rule) => format!("{}{}", raw, rule.remediation),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrelated_text_is_returned_unchanged() {
        let raw = "Error: Invalid provider configuration";
        assert_eq!(classify(raw), raw);
        assert!(diagnose(raw).is_none());
    }

    #[test]
    fn generic_permission_failure_gets_generic_remediation() {
        let raw = "apply failed: Error 403: Permission denied on resource";
        let enhanced = classify(raw);

        assert!(enhanced.starts_with(raw));
        assert!(enhanced.contains("Service account lacks required GCP permissions"));
        assert_eq!(enhanced.matches("SOLUTION:").count(), 1);
    }

    #[test]
    fn capability_rule_wins_over_generic_permission_rule() {
        let raw = "Permission denied: missing cloudsql.instances.create";
        let rule = diagnose(raw).unwrap();

        assert_eq!(rule.cause, "cloudsql-create");
        let enhanced = classify(raw);
        assert!(enhanced.contains("roles/cloudsql.admin"));
        assert!(!enhanced.contains("Check service account roles"));
    }

    #[test]
    fn remediation_is_appended_exactly_once_for_repeated_needles() {
        let raw = "bucket already exists; instance already exists";
        let enhanced = classify(raw);
        assert_eq!(enhanced.matches("SOLUTION:").count(), 1);
        assert!(enhanced.contains("Resource already exists from previous deployment"));
    }

    #[test]
    fn timeouts_are_diagnosed() {
        let raw = "apply failed: terraform apply timed out after 1800 seconds";
        assert_eq!(diagnose(raw).unwrap().cause, "timeout");
    }

    #[test]
    fn classification_is_deterministic() {
        let raw = "Error: googleapi: storage.buckets.create denied";
        assert_eq!(classify(raw), classify(raw));
    }
}
