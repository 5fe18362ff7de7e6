//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ormdoc_core::config::{
    CompilerConfig, DEFAULT_KEY_SEPARATOR, DEFAULT_NAMESPACE_SEPARATOR, DEFAULT_SEARCH_DEPTH,
};
use ormdoc_proto::{ListQuery, SearchRequest, SortSpec};
use serde_json::Value;

/// ormdoc query compiler
#[derive(Parser, Debug)]
#[command(name = "ormdoc")]
#[command(version, about = "Compile class queries into document store pipelines", long_about = None)]
pub struct Args {
    /// Class catalog (JSON).
    #[arg(short, long, global = true, default_value = "catalog.json")]
    pub catalog: PathBuf,

    /// Separator between namespace and class name in table names.
    #[arg(long, global = true, default_value = DEFAULT_NAMESPACE_SEPARATOR)]
    pub namespace_separator: String,

    /// Separator between key values in composite item ids.
    #[arg(long, global = true, default_value = DEFAULT_KEY_SEPARATOR)]
    pub key_separator: String,

    /// Default reference depth followed by free-text search.
    #[arg(long, global = true, default_value_t = DEFAULT_SEARCH_DEPTH)]
    pub search_depth: usize,

    /// Never add a full-text clause to free-text search.
    #[arg(long, global = true)]
    pub no_full_text: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the plan of a query.
    Compile(QueryArgs),

    /// Run a query against a JSON fixture.
    Run {
        #[command(flatten)]
        query: QueryArgs,

        /// Documents by collection name (JSON).
        #[arg(short, long)]
        data: PathBuf,
    },
}

/// Query options shared by all subcommands.
#[derive(clap::Args, Debug)]
pub struct QueryArgs {
    /// Class to query.
    #[arg(long = "class")]
    pub class_name: String,

    /// Domain filter (JSON).
    #[arg(long)]
    pub filter: Option<String>,

    /// Free-text search term.
    #[arg(long)]
    pub search: Option<String>,

    /// Language of the search term.
    #[arg(long)]
    pub lang: Option<String>,

    /// Reference depth of this search.
    #[arg(long)]
    pub depth: Option<usize>,

    /// Sort key, `field` or `field:desc`; repeatable.
    #[arg(long)]
    pub sort: Vec<String>,

    /// Rows to skip.
    #[arg(long)]
    pub offset: Option<u64>,

    /// Maximum rows to return.
    #[arg(long)]
    pub limit: Option<u64>,

    /// Also compute the total number of matching rows.
    #[arg(long)]
    pub count_total: bool,

    /// Attributes to return; repeatable.
    #[arg(long = "field")]
    pub fields: Vec<String>,

    /// Collection to write the result into.
    #[arg(long)]
    pub out: Option<String>,
}

impl Args {
    /// Convert command-line arguments to compiler configuration.
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig::new()
            .with_namespace_separator(&self.namespace_separator)
            .with_key_separator(&self.key_separator)
            .with_search_depth(self.search_depth)
            .with_full_text(!self.no_full_text)
    }
}

impl QueryArgs {
    /// Build the list query.
    pub fn to_query(&self) -> Result<ListQuery, String> {
        let mut query = ListQuery::new(&self.class_name);
        if let Some(filter) = &self.filter {
            let filter: Value =
                serde_json::from_str(filter).map_err(|e| format!("invalid --filter: {}", e))?;
            query = query.with_filter(filter);
        }
        if let Some(term) = &self.search {
            let mut search = SearchRequest::new(term);
            if let Some(lang) = &self.lang {
                search = search.with_language(lang);
            }
            if let Some(depth) = self.depth {
                search = search.with_depth(depth);
            }
            query = query.with_search(search);
        }
        for key in &self.sort {
            query = query.with_sort(parse_sort(key)?);
        }
        query.offset = self.offset;
        query.count = self.limit;
        query.count_total = self.count_total;
        query.projection = self.fields.clone();
        query.output = self.out.clone();
        Ok(query)
    }
}

fn parse_sort(key: &str) -> Result<SortSpec, String> {
    match key.split_once(':') {
        None => Ok(SortSpec::asc(key)),
        Some((field, "asc")) => Ok(SortSpec::asc(field)),
        Some((field, "desc")) => Ok(SortSpec::desc(field)),
        Some((_, direction)) => Err(format!("unknown sort direction: {}", direction)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_compile_args() {
        let args = Args::parse_from([
            "ormdoc",
            "--catalog",
            "shop.json",
            "compile",
            "--class",
            "Order",
            "--filter",
            r#"{"status": "open"}"#,
            "--sort",
            "date:desc",
            "--limit",
            "10",
            "--count-total",
        ]);
        assert_eq!(args.catalog, PathBuf::from("shop.json"));
        let Command::Compile(query) = &args.command else {
            panic!("expected compile");
        };
        let query = query.to_query().unwrap();
        assert_eq!(query.class_name, "Order");
        assert_eq!(query.filter, Some(json!({"status": "open"})));
        assert_eq!(query.sort, vec![SortSpec::desc("date")]);
        assert_eq!(query.count, Some(10));
        assert!(query.count_total);
    }

    #[test]
    fn test_compiler_config() {
        let args = Args::parse_from(["ormdoc", "--no-full-text", "--search-depth", "2", "compile", "--class", "Order"]);
        let config = args.compiler_config();
        assert!(!config.full_text);
        assert_eq!(config.search_depth, 2);
        assert_eq!(config.namespace_separator, "_");
    }

    #[test]
    fn test_parse_sort() {
        assert_eq!(parse_sort("name").unwrap(), SortSpec::asc("name"));
        assert!(parse_sort("name:up").is_err());
    }
}
