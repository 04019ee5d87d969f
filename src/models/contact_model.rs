//! models/contact_model.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    OptedOut,
    Blocked,
}

impl ContactStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OptedOut => "opted_out",
            Self::Blocked => "blocked",
        }
    }
}

/// Fila que devuelve la consulta del resolver.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContactCandidateRow {
    pub id: String,
    pub phone: String,
}

/// Deja sólo los dígitos: "+1 (555) 010-2000" y "15550102000" son el mismo número.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::normalize_phone;

    #[test]
    fn phone_normalization_strips_formatting() {
        assert_eq!(normalize_phone("+1 (555) 010-2000"), "15550102000");
        assert_eq!(normalize_phone("15550102000"), "15550102000");
        assert_eq!(normalize_phone(""), "");
    }
}
