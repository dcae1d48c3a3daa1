use anyhow::{anyhow, Result};
use dialoguer::{Confirm, Input};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::endpoint::{EndpointConfig, UNLIMITED};
use crate::transport::{HttpTransport, RequestSpec, Transport};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub config_path: Option<PathBuf>,
    pub no_prompt: bool,
    pub force: bool,
}

/// Sends one GET to `url` and fails unless it answers with a 2xx status
async fn probe_endpoint(url: &str) -> Result<()> {
    let transport = HttpTransport::new();
    let request = RequestSpec::get("").to_request(url, PROBE_TIMEOUT);
    let response = transport.send(&request).await?;
    if !response.is_success() {
        return Err(anyhow!("endpoint answered with status {}", response.status));
    }
    Ok(())
}

fn prompt_endpoint(config: &mut Config) -> Result<Option<(String, EndpointConfig)>> {
    let add = Confirm::new()
        .with_prompt("Add your own primary endpoint ahead of the defaults?")
        .default(false)
        .interact()?;
    if !add {
        return Ok(None);
    }

    let name: String = Input::new()
        .with_prompt("Endpoint name")
        .with_initial_text("primary")
        .interact_text()?;
    let url: String = Input::new().with_prompt("Endpoint URL").interact_text()?;
    let base_rate: f64 = Input::new()
        .with_prompt("Requests per second")
        .default(1.0)
        .interact_text()?;
    let limit_hour: String = Input::new()
        .with_prompt("Requests per hour (leave empty for no limit)")
        .allow_empty(true)
        .interact_text()?;
    let limit_hour = if limit_hour.is_empty() {
        UNLIMITED
    } else {
        limit_hour.parse()?
    };

    let endpoint = EndpointConfig::new(url, base_rate, [base_rate / 4.0, base_rate * 2.0])
        .with_priority(0)
        .with_limits(limit_hour, UNLIMITED, UNLIMITED);
    endpoint.validate(&name)?;
    config.endpoints.insert(name.clone(), endpoint.clone());
    Ok(Some((name, endpoint)))
}

/// Writes a configuration file, prompting for a primary endpoint unless `no_prompt` is set
///
/// # Errors
///
/// This function will return an error if:
/// - The file exists and `force` is not set
/// - Prompting fails or an answer is invalid
/// - The endpoint probe fails
/// - The file cannot be written
pub async fn initialize_config(opts: InitOptions) -> Result<PathBuf> {
    let config_path = opts.config_path.unwrap_or_else(Config::default_path);

    if config_path.exists() && !opts.force {
        return Err(anyhow!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        ));
    }

    let mut config = Config::default();

    if !opts.no_prompt {
        println!("Initializing turnstile configuration...\n");

        if let Some((name, endpoint)) = prompt_endpoint(&mut config)? {
            let probe = Confirm::new()
                .with_prompt(format!("Check that {name} responds now?"))
                .default(true)
                .interact()?;
            if probe {
                print!("Probing {}... ", endpoint.url);
                match probe_endpoint(&endpoint.url).await {
                    Ok(()) => println!("✓ Success"),
                    Err(e) => {
                        println!("✗ Failed");
                        return Err(anyhow!("Endpoint probe failed: {}", e));
                    }
                }
            }
        }
    }

    config.validate()?;
    config.write(&config_path)?;

    println!("\nConfiguration created at: {}", config_path.display());
    Ok(config_path)
}
