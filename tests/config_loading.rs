use std::io::Write;

use lattice_core::config::{AppConfig, BackendMode, ModelRole};

#[test]
fn minimal_toml_gets_full_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[llm]\nmode = \"local\"").unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.llm.mode, BackendMode::Local);
    assert_eq!(config.llm.ollama_base_url, "http://localhost:11434");
    assert_eq!(config.budget.max_context_tokens, 4096);
    assert_eq!(config.lock.acquire_timeout_secs, 60);
    assert_eq!(config.gate.poll_interval_ms, 2000);
    assert!(config.cache.enabled);
    assert!(config.log.is_none());
}

#[test]
fn env_vars_expand_into_credentials() {
    std::env::set_var("LATTICE_TEST_GROQ_KEY", "gsk_from_env");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[llm]\nmode = \"hosted\"\ngroq_api_keys = [\"${{LATTICE_TEST_GROQ_KEY}}\"]"
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.llm.groq_api_keys, vec!["gsk_from_env"]);

    std::env::remove_var("LATTICE_TEST_GROQ_KEY");
}

#[test]
fn model_roles_resolve_with_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[llm]\nmodel_writing = \"llama-3.1-70b\"\n\n[budget]\nmax_context_tokens = 8192"
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.llm.model_for_role(ModelRole::Writing), "llama-3.1-70b");
    assert_eq!(config.llm.model_for_role(ModelRole::Reasoning), "phi3:mini");
    assert_eq!(config.budget.max_context_tokens, 8192);
}

#[test]
fn missing_file_is_a_config_not_found_error() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/lattice.toml")).unwrap_err();
    assert!(matches!(
        err,
        lattice_core::error::LatticeError::ConfigNotFound(_)
    ));
}
