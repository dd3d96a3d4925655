pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE kv (
  key             TEXT PRIMARY KEY,
  value           TEXT NOT NULL,
  updated_ms      INTEGER NOT NULL
);

COMMIT;
"#
;
