use std::env;

/// Resolves a GitLab token using the documented fallback chain (spec §6):
/// an explicit config value, then `GITLAB_TOKEN`, then `GITLAB_PRIVATE_TOKEN`.
pub fn resolve_gitlab_token(config_value: Option<&str>) -> Option<String> {
    if let Some(v) = config_value {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    env::var("GITLAB_TOKEN")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("GITLAB_PRIVATE_TOKEN").ok().filter(|v| !v.is_empty()))
}

#[derive(Debug, Clone)]
pub struct SvnCredentials {
    pub username: String,
    pub password: String,
}

/// Resolves SVN credentials: `SVN_USERNAME` + `SVN_PASSWORD`, or
/// `SVN_USERNAME` + the value of a configured `password_env` variable.
pub fn resolve_svn_credentials(password_env: Option<&str>) -> Option<SvnCredentials> {
    let username = env::var("SVN_USERNAME").ok()?;
    let password = match password_env {
        Some(name) => env::var(name).ok()?,
        None => env::var("SVN_PASSWORD").ok()?,
    };
    Some(SvnCredentials { username, password })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_value_wins_over_env() {
        temp_env::with_var("GITLAB_TOKEN", Some("env-token"), || {
            assert_eq!(
                resolve_gitlab_token(Some("config-token")),
                Some("config-token".to_string())
            );
        });
    }

    #[test]
    fn falls_back_to_gitlab_token_then_private_token() {
        temp_env::with_vars(
            [
                ("GITLAB_TOKEN", None::<&str>),
                ("GITLAB_PRIVATE_TOKEN", Some("private-token")),
            ],
            || {
                assert_eq!(
                    resolve_gitlab_token(None),
                    Some("private-token".to_string())
                );
            },
        );
    }

    #[test]
    fn svn_credentials_use_custom_password_env_when_configured() {
        temp_env::with_vars(
            [
                ("SVN_USERNAME", Some("alice")),
                ("SVN_PASSWORD", Some("ignored")),
                ("TENANT_SVN_PASSWORD", Some("actual")),
            ],
            || {
                let creds = resolve_svn_credentials(Some("TENANT_SVN_PASSWORD")).unwrap();
                assert_eq!(creds.username, "alice");
                assert_eq!(creds.password, "actual");
            },
        );
    }
}
