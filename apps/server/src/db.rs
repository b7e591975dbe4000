use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // Enable WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL")
        .execute(pool)
        .await?;

    // Create migrations tracking table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    // Run 001_init only if not already applied
    let applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = '001_init'")
            .fetch_one(pool)
            .await?;

    if !applied {
        let migration_sql = include_str!("../migrations/001_init.sql");
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES ('001_init')")
            .execute(pool)
            .await?;
        tracing::info!("Applied migration: 001_init");
    }

    // 002: Starter catalog + default working hours (skipped if a catalog exists)
    let seed_applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = '002_seed'")
            .fetch_one(pool)
            .await?;

    if !seed_applied {
        let have_services: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM services")
            .fetch_one(pool)
            .await?;

        if !have_services {
            sqlx::query(
                "INSERT INTO services
                    (name, description, price, duration_min, buffer_before_min, buffer_after_min,
                     requires_prepayment, sort_order)
                 VALUES
                    ('Signature facial', 'Cleansing facial with massage', 6500, 60, 10, 10, 1, 1),
                    ('Classic manicure', 'Shape, cuticles and polish', 3500, 45, 0, 15, 0, 2),
                    ('Brow shaping', 'Wax and tweeze', 2000, 30, 5, 5, 0, 3)",
            )
            .execute(pool)
            .await?;

            sqlx::query("INSERT INTO staff (name) VALUES ('Sasha'), ('Robin')")
                .execute(pool)
                .await?;

            sqlx::query(
                "INSERT INTO staff_services (staff_id, service_id)
                 SELECT st.id, sv.id FROM staff st CROSS JOIN services sv",
            )
            .execute(pool)
            .await?;

            // Mon-Fri 09:00-18:00 for everyone, Saturday 10:00-16:00 for Robin
            sqlx::query(
                "INSERT INTO working_hours (staff_id, weekday, start_time, end_time)
                 SELECT st.id, wd.value, '09:00', '18:00'
                 FROM staff st, (SELECT 0 AS value UNION SELECT 1 UNION SELECT 2
                                 UNION SELECT 3 UNION SELECT 4) wd",
            )
            .execute(pool)
            .await?;
            sqlx::query(
                "INSERT INTO working_hours (staff_id, weekday, start_time, end_time)
                 SELECT id, 5, '10:00', '16:00' FROM staff WHERE name = 'Robin'",
            )
            .execute(pool)
            .await?;
        }

        sqlx::query("INSERT INTO _migrations (name) VALUES ('002_seed')")
            .execute(pool)
            .await?;
        tracing::info!("Applied migration: 002_seed");
    }

    // 003: Indexes for the hot paths (availability, conflict check, sweeper, ledger)
    let indexes_applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = '003_indexes'")
            .fetch_one(pool)
            .await?;

    if !indexes_applied {
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservations_staff_start
             ON reservations(staff_id, start_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservations_pending
             ON reservations(status, pending_expires_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_payment_events_reservation
             ON payment_events(reservation_id)",
        )
        .execute(pool)
        .await?;
        // Gateway events must collapse to a single ledger row on redelivery
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_events_provider
             ON payment_events(provider_event_id) WHERE provider_event_id IS NOT NULL",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservation_events_reservation
             ON reservation_events(reservation_id)",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ('003_indexes')")
            .execute(pool)
            .await?;
        tracing::info!("Applied migration: 003_indexes");
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    // A single connection keeps every test query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations");
    pool
}
