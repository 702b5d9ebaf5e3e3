use crate::{
    error::{JobError, Result},
    models::Feature,
};

/// Column the scoring function writes its result into.
pub const RESULT_COLUMN: &str = "prediction_result";

/// Everything a planner needs to score `input_table` into `output_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringParams {
    pub job_id: String,
    pub database: String,
    pub input_table: String,
    pub output_table: String,
    pub output_column: String,
    pub features: Vec<Feature>,
    /// Present for evaluations, which keep the label next to the prediction.
    pub label: Option<Feature>,
    pub algorithm: String,
    pub model_id: String,
    pub model_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub main_query: String,
    pub create_output_query: String,
    pub output_exists: bool,
}

/// Turns job parameters into backend query text.
pub trait QueryPlanner: Send + Sync {
    fn plan(&self, params: &ScoringParams) -> Result<QueryPlan>;

    /// Statement registering the scoring function for a session.
    fn scoring_function_ddl(&self) -> String;
}

/// Emits HiveQL that calls a scoring UDF. The output table is created with
/// `IF NOT EXISTS`, so it is always reported as missing and creating it is idempotent.
#[derive(Debug, Clone)]
pub struct HiveQueryPlanner {
    udf_name: String,
    udf_class: String,
}

impl HiveQueryPlanner {
    pub fn new(udf_name: impl Into<String>, udf_class: impl Into<String>) -> Self {
        Self {
            udf_name: udf_name.into(),
            udf_class: udf_class.into(),
        }
    }
}

impl QueryPlanner for HiveQueryPlanner {
    fn plan(&self, params: &ScoringParams) -> Result<QueryPlan> {
        for name in [
            params.database.as_str(),
            params.input_table.as_str(),
            params.output_table.as_str(),
            params.output_column.as_str(),
        ] {
            ensure_identifier(name)?;
        }
        if params.features.is_empty() {
            return Err(JobError::Validation(format!(
                "model {} has no feature columns",
                params.model_id
            )));
        }

        let mut columns = Vec::new();
        if let Some(label) = &params.label {
            ensure_identifier(&label.name)?;
            columns.push(label);
        }
        for feature in &params.features {
            ensure_identifier(&feature.name)?;
            columns.push(feature);
        }

        let output = format!("{}.{}", params.database, params.output_table);
        let column_defs = columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        let create_output_query = format!(
            "CREATE TABLE IF NOT EXISTS {output} ({column_defs}, {} STRING)",
            params.output_column
        );

        let selected = columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let feature_args = params
            .features
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let main_query = format!(
            "INSERT OVERWRITE TABLE {output} SELECT {selected}, {udf}('{algorithm}', '{model}', '{instance}', {feature_args}) AS {result} FROM {database}.{input}",
            udf = self.udf_name,
            algorithm = escape_literal(&params.algorithm),
            model = escape_literal(&params.model_id),
            instance = escape_literal(&params.model_instance_id),
            result = params.output_column,
            database = params.database,
            input = params.input_table,
        );

        Ok(QueryPlan {
            main_query,
            create_output_query,
            output_exists: false,
        })
    }

    fn scoring_function_ddl(&self) -> String {
        format!(
            "CREATE TEMPORARY FUNCTION {} AS '{}'",
            self.udf_name,
            escape_literal(&self.udf_class)
        )
    }
}

fn ensure_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(JobError::Validation(format!("`{name}` is not a valid table or column name")))
    }
}

fn escape_literal(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(name: &str, data_type: &str) -> Feature {
        Feature {
            name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }

    fn params() -> ScoringParams {
        ScoringParams {
            job_id: "job-1".to_string(),
            database: "default".to_string(),
            input_table: "events".to_string(),
            output_table: "scored_events".to_string(),
            output_column: RESULT_COLUMN.to_string(),
            features: vec![feature("age", "INT"), feature("income", "DOUBLE")],
            label: None,
            algorithm: "logistic_regression".to_string(),
            model_id: "churn".to_string(),
            model_instance_id: "mi-1".to_string(),
        }
    }

    #[test]
    fn prediction_plan_calls_the_udf() {
        let plan = HiveQueryPlanner::new("predict", "com.example.Udf")
            .plan(&params())
            .expect("plan");
        assert_eq!(
            plan.create_output_query,
            "CREATE TABLE IF NOT EXISTS default.scored_events (age INT, income DOUBLE, prediction_result STRING)"
        );
        assert_eq!(
            plan.main_query,
            "INSERT OVERWRITE TABLE default.scored_events SELECT age, income, predict('logistic_regression', 'churn', 'mi-1', age, income) AS prediction_result FROM default.events"
        );
        assert!(!plan.output_exists);
    }

    #[test]
    fn evaluation_plan_keeps_the_label() {
        let mut params = params();
        params.label = Some(feature("churned", "BOOLEAN"));
        let plan = HiveQueryPlanner::new("predict", "com.example.Udf")
            .plan(&params)
            .expect("plan");
        assert!(plan.create_output_query.contains("(churned BOOLEAN, age INT"));
        assert!(plan.main_query.contains("SELECT churned, age, income, predict("));
    }

    #[test]
    fn malformed_table_name_is_a_validation_error() {
        let mut params = params();
        params.output_table = "scored; DROP TABLE x".to_string();
        let err = HiveQueryPlanner::new("predict", "com.example.Udf")
            .plan(&params)
            .expect_err("bad identifier");
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn registration_statement() {
        let ddl = HiveQueryPlanner::new("predict", "com.example.Udf").scoring_function_ddl();
        assert_eq!(ddl, "CREATE TEMPORARY FUNCTION predict AS 'com.example.Udf'");
    }
}
