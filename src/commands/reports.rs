use serde_json::Value;

use super::{ok, Call};
use crate::audit::{self, LogQuery};
use crate::error::Result;
use crate::reports::{self, ReportRange};

pub fn sales(call: Call<'_>) -> Result<Value> {
    let range: ReportRange = call.args()?;
    ok(reports::sales_report(
        &call.state.db,
        &call.principal,
        &range,
        call.state.utc_offset(),
    )?)
}

pub fn logs(call: Call<'_>) -> Result<Value> {
    let query: LogQuery = call.args()?;
    ok(audit::list_logs(&call.state.db, &call.principal, &query)?)
}
