use std::path::Path;

use anyhow::{bail, Context, Result};
use dialoguer::Input;
use minijinja::Environment;

use crate::output;

const TEMPLATE: &str = include_str!("../../templates/tako.yaml.j2");

pub fn run(project_root: &Path) -> Result<()> {
    let config_path = project_root.join("tako.yaml");
    if config_path.exists() || project_root.join("tako.json").exists() {
        bail!("a tako config already exists in this directory");
    }

    let default_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "myapp".to_string());

    let (project_name, user) = if crate::runtime::non_interactive() {
        (default_name, "deploy".to_string())
    } else {
        let name: String = Input::new()
            .with_prompt("Project name")
            .default(default_name)
            .interact_text()?;
        let user: String = Input::new()
            .with_prompt("SSH user on your servers")
            .default("deploy".to_string())
            .interact_text()?;
        (name, user)
    };

    let mut env = Environment::new();
    env.add_template("tako.yaml", TEMPLATE)?;
    let tmpl = env.get_template("tako.yaml").unwrap();
    let content = tmpl.render(minijinja::context! {
        project_name => project_name,
        user => user,
    })?;

    std::fs::write(&config_path, content).context("Failed to write tako.yaml")?;
    output::success("Created tako.yaml");

    let example_path = project_root.join(".env.example");
    if !example_path.exists() {
        std::fs::write(&example_path, "# Copy to .env and fill in real values\n")
            .context("Failed to write .env.example")?;
        output::success("Created .env.example");
    }

    ensure_gitignore(project_root)?;

    output::info("Edit tako.yaml, then run: tako deploy");
    Ok(())
}

/// `.tako/` holds secrets and state; neither it nor `.env` may ever be
/// committed.
fn ensure_gitignore(project_root: &Path) -> Result<()> {
    let path = project_root.join(".gitignore");
    let existing = if path.exists() {
        std::fs::read_to_string(&path)?
    } else {
        String::new()
    };

    let mut additions = Vec::new();
    for entry in [".tako/", ".env"] {
        if !existing.lines().any(|line| line.trim() == entry) {
            additions.push(entry);
        }
    }
    if additions.is_empty() {
        return Ok(());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in &additions {
        content.push_str(entry);
        content.push('\n');
    }
    std::fs::write(&path, content).context("Failed to update .gitignore")?;
    output::success(&format!(".gitignore now covers {}", additions.join(", ")));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitignore_is_created_with_both_entries() {
        let dir = tempfile::tempdir().unwrap();
        ensure_gitignore(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(content.lines().any(|l| l == ".tako/"));
        assert!(content.lines().any(|l| l == ".env"));
    }

    #[test]
    fn existing_entries_are_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n.env\n").unwrap();
        ensure_gitignore(dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches(".env").count(), 1);
        assert!(content.contains("target/"));
        assert!(content.contains(".tako/"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tako.yaml"), "name: x\n").unwrap();
        std::env::set_var("TAKO_NONINTERACTIVE", "1");
        assert!(run(dir.path()).is_err());
        std::env::remove_var("TAKO_NONINTERACTIVE");
    }
}
