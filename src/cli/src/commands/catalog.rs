//! `imirror catalog` command.

use clap::Args;
use imirror_core::config::MirrorConfig;

use crate::output;

#[derive(Args)]
pub struct CatalogArgs {
    /// Print the catalog as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: CatalogArgs,
    config: MirrorConfig,
) -> Result<i32, Box<dyn std::error::Error>> {
    config.validate()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config.components)?);
        return Ok(0);
    }

    let mut table = output::new_table(&["NAME", "IMAGE", "ARCHITECTURES", "RULES"]);
    for component in &config.components {
        let arches: Vec<&str> = component.architectures.iter().map(|a| a.as_str()).collect();
        table.add_row(&[
            component.name.clone(),
            component.image.clone(),
            arches.join(","),
            output::describe_policy(&component.policy),
        ]);
    }
    println!("{table}");
    Ok(0)
}
