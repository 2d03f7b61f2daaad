use comfy_table::{ContentArrangement, Table};
use fleet_harness::admin::protocol::{MemberStatus, OpTime};

use crate::commands::validate::TopologySummary;

fn new_table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table
}

fn format_optime(optime: Option<OpTime>) -> String {
    optime.map_or_else(|| "--".to_owned(), |op| op.to_string())
}

pub fn print_members(members: &[MemberStatus]) {
    let mut table = new_table();
    table.set_header(vec!["ID", "NAME", "STATE", "HEALTH", "OPTIME"]);

    for m in members {
        let name = if m.is_self { format!("{} *", m.name) } else { m.name.to_string() };
        let health = if m.health == 1 { "up" } else { "down" };
        table.add_row(vec![
            m.id.to_string(),
            name,
            m.state.to_string(),
            health.to_owned(),
            format_optime(m.optime),
        ]);
    }

    println!("{table}");
}

pub fn print_topologies(summaries: &[TopologySummary]) {
    let mut table = new_table();
    table.set_header(vec!["NAME", "KIND", "MEMBERS", "MAJORITY", "BRIDGED"]);

    for s in summaries {
        let majority = s.majority.map_or_else(|| "--".to_owned(), |m| m.to_string());
        table.add_row(vec![
            s.name.clone(),
            s.kind.to_owned(),
            s.members.to_string(),
            majority,
            if s.bridged { "yes" } else { "no" }.to_owned(),
        ]);
    }

    println!("{table}");
}
