//! `ferry tables`: dispatch tables and the field shapes of every operation.

use super::Session;
use crate::output::StyledOutput;
use ferry_abi::{DispatchTable, ModuleId, OpDescriptor};
use ferry_runtime::BridgeConfig;
use serde::Serialize;
use termcolor::ColorChoice;

#[derive(Serialize)]
struct TableView {
    module: ModuleId,
    name: &'static str,
    operations: Vec<&'static OpDescriptor>,
}

/// Matches a module by name or number.
fn selected(table: &DispatchTable, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(filter) => {
            table.name() == filter || filter.parse::<u32>().ok() == Some(table.module().0)
        }
    }
}

fn signature(op: &OpDescriptor) -> String {
    let params: Vec<String> = op
        .params
        .iter()
        .map(|param| format!("{}: {}", param.name, param.shape))
        .collect();
    let plural = if op.fields == 1 { "" } else { "s" };
    format!(
        "{}({}) -> {}  [{} field{}]",
        op.name,
        params.join(", "),
        op.returns,
        op.fields,
        plural
    )
}

pub fn execute(
    config: &BridgeConfig,
    filter: Option<&str>,
    json: bool,
    choice: ColorChoice,
) -> anyhow::Result<()> {
    let session = Session::open(config)?;
    let tables: Vec<&DispatchTable> = session
        .bridge
        .registry()
        .tables()
        .filter(|table| selected(table, filter))
        .collect();
    if let (Some(filter), true) = (filter, tables.is_empty()) {
        anyhow::bail!("no module named {}", filter);
    }

    if json {
        let views: Vec<TableView> = tables
            .iter()
            .map(|table| TableView {
                module: table.module(),
                name: table.name(),
                operations: table.descriptors().collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    let mut out = StyledOutput::new(choice);
    for table in tables {
        out.bold(&format!("{} {}", table.module(), table.name()));
        out.newline();
        for op in table.descriptors() {
            out.info(&format!("  {:>2}  ", op.local));
            out.plain(&signature(op));
            out.newline();
        }
        out.newline();
    }
    out.flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_user::{ReferenceUser, UserApiOp};
    use std::sync::Arc;

    #[test]
    fn test_signature() {
        assert_eq!(
            signature(UserApiOp::ToUpper.descriptor()),
            "to_upper(c: u32) -> u32  [1 field]"
        );
    }

    #[test]
    fn test_selected_by_name_or_number() {
        let table = ferry_user::user::register(Arc::new(ReferenceUser::new()));
        assert!(selected(&table, None));
        assert!(selected(&table, Some("user")));
        assert!(selected(&table, Some("1")));
        assert!(!selected(&table, Some("canvas")));
    }

    #[test]
    fn test_json_view() {
        let table = ferry_user::user::register(Arc::new(ReferenceUser::new()));
        let view = TableView {
            module: table.module(),
            name: table.name(),
            operations: table.descriptors().collect(),
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["module"], 1);
        assert_eq!(value["operations"].as_array().unwrap().len(), 23);
        assert_eq!(value["operations"][0]["name"], "set_rect");
    }
}
