use std::env;
use std::fmt;
use std::str::FromStr;

/// Variable selecting the log format.
pub const ENVIRONMENT_VAR: &str = "ENVIRONMENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    /// Reads `ENVIRONMENT`. Unset or unknown values mean development.
    pub fn from_env() -> Self {
        env::var(ENVIRONMENT_VAR)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment {other:?}")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse() {
        assert_eq!("prod".parse(), Ok(Environment::Production));
        assert_eq!(" Production ".parse(), Ok(Environment::Production));
        assert_eq!("dev".parse(), Ok(Environment::Development));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        unsafe { env::set_var(ENVIRONMENT_VAR, "PROD") };
        assert_eq!(Environment::from_env(), Environment::Production);

        unsafe { env::set_var(ENVIRONMENT_VAR, "staging") };
        assert_eq!(
            Environment::from_env(),
            Environment::Development,
            "unknown values fall back to development"
        );

        unsafe { env::remove_var(ENVIRONMENT_VAR) };
        assert_eq!(Environment::from_env(), Environment::Development);
    }

    #[test]
    fn test_display_matches_as_str() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Development.to_string(), "development");
    }
}
