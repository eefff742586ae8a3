use std::io::{stdin, stdout, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::settings;

struct InitOpts {
    client_id: String,
    secret: String,
    redirect_uri: String,
    classifier_url: String,
    classifier_key: String,
}

fn to_init_opts(
    client_id: &str,
    secret: &str,
    redirect_uri: &str,
    classifier_url: &str,
    classifier_key: &str,
) -> Result<InitOpts> {
    if client_id.is_empty() {
        return Err(anyhow!("provider client ID must not be empty"));
    }

    if secret.is_empty() {
        return Err(anyhow!("provider client secret must not be empty"));
    }

    if redirect_uri.is_empty() {
        return Err(anyhow!("redirect URI must not be empty"));
    }

    Ok(InitOpts {
        client_id: client_id.to_string(),
        secret: secret.to_string(),
        redirect_uri: redirect_uri.to_string(),
        classifier_url: classifier_url.to_string(),
        classifier_key: classifier_key.to_string(),
    })
}

fn prompt_opts() -> Result<InitOpts> {
    let mut buf = String::new();
    let stdin = stdin();

    print!("Provider Client ID: ");
    stdout().flush()?;
    stdin.read_line(&mut buf)?;

    print!("Provider Client Secret: ");
    stdout().flush()?;
    stdin.read_line(&mut buf)?;

    print!("Redirect URI: ");
    stdout().flush()?;
    stdin.read_line(&mut buf)?;

    print!("Classifier Base URL: ");
    stdout().flush()?;
    stdin.read_line(&mut buf)?;

    print!("Classifier API Key: ");
    stdout().flush()?;
    stdin.read_line(&mut buf)?;

    let mut lines = buf.lines();
    let client_id = lines.next().expect("provider client ID must be provided");
    let secret = lines.next().expect("provider client secret must be provided");
    let redirect_uri = lines.next().expect("redirect URI must be provided");
    let classifier_url = lines.next().unwrap_or_default();
    let classifier_key = lines.next().unwrap_or_default();

    to_init_opts(
        client_id.trim(),
        secret.trim(),
        redirect_uri.trim(),
        classifier_url.trim(),
        classifier_key.trim(),
    )
}

fn render(opts: &InitOpts) -> String {
    format!(
        r#"default_user = "local"

[provider]
client_id = "{}"
secret = "{}"
redirect_uri = "{}"

[classifier]
base_url = "{}"
api_key = "{}"
"#,
        opts.client_id, opts.secret, opts.redirect_uri, opts.classifier_url, opts.classifier_key,
    )
}

pub async fn run(conf_path: Option<&str>) -> Result<()> {
    let path = match conf_path {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(settings::default_config_path()),
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let opts = prompt_opts()?;
    std::fs::write(&path, render(&opts))?;

    println!("wrote configuration to {}", path.display());

    Ok(())
}
