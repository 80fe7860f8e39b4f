//! Selector compilation: parse Kubernetes label and field selectors and
//! render them as SQL predicates over the metadata index tables.
//!
//! The rendered fragments append `AND <id> IN (subquery)` clauses to a
//! caller-supplied query, so they intersect with whatever the primary
//! statement already filters. The compiler never executes SQL itself; it
//! only returns a suffix plus the arguments to bind.

#![forbid(unsafe_code)]

mod fields;
mod labels;

use fields::FieldOperator;
use labels::Operator;

/// Errors from selector parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("label selector parse failed: {0}")]
    Label(String),
    #[error("field selector parse failed: {0}")]
    Field(String),
}

/// SQL argument produced by the compiler. Kept driver-neutral so any
/// dialect can bind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlArg {
    Text(String),
    Int(i64),
}

impl From<&str> for SqlArg {
    fn from(s: &str) -> Self {
        SqlArg::Text(s.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(s: String) -> Self {
        SqlArg::Text(s)
    }
}

impl From<i64> for SqlArg {
    fn from(i: i64) -> Self {
        SqlArg::Int(i)
    }
}

/// Render the `WHERE` additions for both selectors against `sql`.
///
/// The id column is picked by inspecting the incoming statement
/// (`maxkv.theid`, then `c.theid`, else `kv.id`), and a `$` anywhere in it
/// switches placeholder rendering from `?` to `$N` numbered from
/// `args.len() + 1`. Empty selectors contribute nothing and leave `args`
/// untouched; callers must thread the returned vector.
pub fn render_selectors_where(
    sql: &str,
    prefix: &str,
    label_selector: &str,
    field_selector: &str,
    args: Vec<SqlArg>,
    field_lookup_sql: &str,
) -> Result<(String, Vec<SqlArg>), SelectorError> {
    let id_col = if sql.contains("maxkv.theid") {
        "maxkv.theid"
    } else if sql.contains("c.theid") {
        "c.theid"
    } else {
        "kv.id"
    };
    let numbered = sql.contains('$');

    let (labels_where, args) =
        render_label_selector_where(id_col, prefix, label_selector, args, numbered)?;
    let (fields_where, args) = render_field_selector_where(
        id_col,
        prefix,
        field_selector,
        args,
        numbered,
        field_lookup_sql,
    )?;
    Ok((format!("{labels_where}{fields_where}"), args))
}

/// Render the label-selector subquery: one OR-joined clause per
/// requirement, `GROUP BY kine_id HAVING COUNT(kine_id) = <n>` so a row
/// must satisfy every requirement.
pub fn render_label_selector_where(
    id_col: &str,
    prefix: &str,
    label_selector: &str,
    mut args: Vec<SqlArg>,
    numbered: bool,
) -> Result<(String, Vec<SqlArg>), SelectorError> {
    if label_selector.is_empty() {
        return Ok((String::new(), args));
    }
    let reqs = labels::parse(label_selector)?;
    if reqs.is_empty() {
        return Ok((String::new(), args));
    }

    let args_n = args.len();
    args.push(SqlArg::from(prefix));

    let mut wheres = Vec::with_capacity(reqs.len());
    for req in &reqs {
        match req.op {
            Operator::DoesNotExist => {
                wheres.push(
                    "(kine_id NOT IN (SELECT kine_id FROM kine_labels WHERE kine_name LIKE ? AND name = ? GROUP BY kine_id))"
                        .to_string(),
                );
                args.push(SqlArg::from(prefix));
                args.push(SqlArg::from(req.key.clone()));
            }
            Operator::Equals | Operator::DoubleEquals => {
                wheres.push("(name = ? AND value = ?)".to_string());
                args.push(SqlArg::from(req.key.clone()));
                args.push(SqlArg::from(req.values[0].clone()));
            }
            Operator::In => {
                wheres.push(format!("(name = ? AND value IN ({}))", placeholders(req.values.len())));
                args.push(SqlArg::from(req.key.clone()));
                args.extend(req.values.iter().cloned().map(SqlArg::from));
            }
            Operator::NotEquals => {
                wheres.push("(name = ? AND value != ?)".to_string());
                args.push(SqlArg::from(req.key.clone()));
                args.push(SqlArg::from(req.values[0].clone()));
            }
            Operator::NotIn => {
                wheres.push(format!(
                    "(name = ? AND value NOT IN ({}))",
                    placeholders(req.values.len())
                ));
                args.push(SqlArg::from(req.key.clone()));
                args.extend(req.values.iter().cloned().map(SqlArg::from));
            }
            Operator::Exists => {
                wheres.push("(name IN (?))".to_string());
                args.push(SqlArg::from(req.key.clone()));
            }
            Operator::GreaterThan => {
                wheres.push("(name = ? AND value > ?)".to_string());
                args.push(SqlArg::from(req.key.clone()));
                args.push(SqlArg::from(req.values[0].clone()));
            }
            Operator::LessThan => {
                wheres.push("(name = ? AND value < ?)".to_string());
                args.push(SqlArg::from(req.key.clone()));
                args.push(SqlArg::from(req.values[0].clone()));
            }
        }
    }
    args.push(SqlArg::Int(reqs.len() as i64));

    let clauses = wheres.join(" OR ");
    let mut where_sql = format!(
        " AND {id_col} IN (
	SELECT kine_id
	FROM kine_labels
	WHERE kine_name LIKE ? AND ({clauses})
	GROUP BY kine_id
	HAVING COUNT(kine_id) = ?
)
"
    );
    if numbered {
        where_sql = replace_params_to_numbers(&where_sql, args_n);
    }
    Ok((where_sql, args))
}

/// Render the field-selector subquery: AND-joined lookups over the
/// JSON-encoded fields row, with dotted names translated to underscores.
pub fn render_field_selector_where(
    id_col: &str,
    prefix: &str,
    field_selector: &str,
    mut args: Vec<SqlArg>,
    numbered: bool,
    field_lookup_sql: &str,
) -> Result<(String, Vec<SqlArg>), SelectorError> {
    if field_selector.is_empty() {
        return Ok((String::new(), args));
    }
    let reqs = fields::parse(field_selector)?;
    if reqs.is_empty() {
        return Ok((String::new(), args));
    }

    let args_n = args.len();
    args.push(SqlArg::from(prefix));

    let mut wheres = Vec::with_capacity(reqs.len());
    for req in &reqs {
        let field = req.field.replace('.', "_");

        let lookup = if field_lookup_sql.contains("%s") {
            field_lookup_sql.replace("%s", &field)
        } else {
            args.push(SqlArg::from(field));
            field_lookup_sql.to_string()
        };
        args.push(SqlArg::from(req.value.clone()));

        match req.op {
            FieldOperator::Equals | FieldOperator::DoubleEquals => {
                wheres.push(format!("({lookup})"));
            }
            FieldOperator::NotEquals => {
                wheres.push(format!("(NOT {lookup})"));
            }
        }
    }

    let clauses = wheres.join(" AND ");
    let mut where_sql = format!(
        " AND {id_col} IN (
	SELECT kine_id
	FROM kine_fields
	WHERE kine_name LIKE ? AND ({clauses})
	GROUP BY kine_id
)
"
    );
    if numbered {
        where_sql = replace_params_to_numbers(&where_sql, args_n);
    }
    Ok((where_sql, args))
}

/// Rewrite every `?` into `$N`, numbering left to right from `args + 1`.
pub fn replace_params_to_numbers(where_sql: &str, mut args: usize) -> String {
    let mut out = String::with_capacity(where_sql.len() + 8);
    for c in where_sql.chars() {
        if c == '?' {
            args += 1;
            out.push('$');
            out.push_str(&args.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

fn placeholders(n: usize) -> String {
    let mut out = "?,".repeat(n);
    out.pop();
    out
}
