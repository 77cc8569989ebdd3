//! Creates an empty config for every node of the snapshot.

use super::Context;
use crate::crd::NodeConfigSpec;
use crate::error::Result;

pub(super) fn run(ctx: &mut Context) -> Result<()> {
    for node in ctx.filter.cluster_nodes() {
        ctx.results
            .insert(node.name().to_string(), NodeConfigSpec::default());
    }
    Ok(())
}
