use super::runner::Migration;

const BROKER_SQL: &str = include_str!("../../migrations/0001_conveyor_broker.sql");

/// Schema the postgres transport needs, in apply order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0001_conveyor_broker", BROKER_SQL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_order() {
        let migrations = builtin_migrations();
        assert_eq!(migrations[0].name, "0001_conveyor_broker");
        let mut names: Vec<&str> = migrations.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            migrations.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_broker_tables_defined() {
        let sql = &builtin_migrations()[0].sql;
        for table in [
            "conveyor_stream",
            "conveyor_job_status",
            "conveyor_workers",
            "conveyor_locks",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing {}",
                table
            );
        }
    }
}
