//! Control record codec commands

use anyhow::Context;
use orgctl_lib::Ctl;

pub fn encode(owner: Option<&str>, desc: Option<&str>, tags: &[String]) -> anyhow::Result<()> {
    println!("{}", build(owner, desc, tags)?.encode()?);
    Ok(())
}

pub fn decode(record: &str) -> anyhow::Result<()> {
    let ctl = Ctl::decode(record).context("failed to decode control record")?;
    println!("{}", serde_json::to_string_pretty(&ctl)?);
    Ok(())
}

fn build(owner: Option<&str>, desc: Option<&str>, tags: &[String]) -> anyhow::Result<Ctl> {
    let ctl = Ctl::new()
        .with_owner(owner.unwrap_or_default())
        .with_desc(desc.unwrap_or_default())
        .with_tags(tags.iter().cloned())?;
    Ok(ctl)
}
