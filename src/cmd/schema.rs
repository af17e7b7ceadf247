//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_output,
    cmd::extract::ExtractOutput,
    prelude::*,
    queues::ocr::aggregate::ExtractionResult,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The full output of `extract`.
    ExtractOutput,
    /// Just the extracted text and word count.
    ExtractionResult,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::ExtractOutput => schema_for!(ExtractOutput),
        SchemaType::ExtractionResult => schema_for!(ExtractionResult),
    };
    write_json_output(schema_opts.output_path.as_deref(), &schema)
        .await
        .context("failed to write schema")
}
