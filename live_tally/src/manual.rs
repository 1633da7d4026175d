/*!

This is the long-form manual for `live_tally` and `democradeck`.

## Sources of votes

Votes reach the tally in two ways:
* the **snapshot**: every vote row stored so far, queried once at startup
  (see [`crate::snapshot::SnapshotSource`]). A row only needs a candidate
  identifier. Rows without an event identifier get one derived from the
  candidate and from the rank of the row among the rows of that candidate,
  for example `snapshot:dave-00000002`.
* the **live subscription**: one notification per inserted row, carrying the
  identifier of the row (see [`crate::subscriber::LiveSource`]).

Rows of candidates that are not registered are ignored on both paths.

## Reconciliation

The subscription usually opens before the snapshot returns. Until the
snapshot resolves, live votes are held back in the order they arrived. The
snapshot is then applied, followed by the held votes. Afterwards live votes
are applied as they come.

A vote is identified by its event identifier: applying the same identifier
twice is a no-op. The final counts therefore only depend on the set of votes,
not on the path or the order through which they arrived.

If the snapshot keeps failing after the configured number of retries, the
engine reports `SyncStatus::Degraded` and counts the live votes only.

When the subscription drops, it is opened again with backoff and the snapshot
is loaded again to recover the votes missed in between.

## Submitting votes

[`crate::TallyEngine::submit`] validates the candidate and the category, then
stores the vote through [`crate::gateway::VoteWriter`]. The count is **not**
incremented locally: the stored vote comes back through the subscription and
is counted there. Failures are reported once and never retried.

Each outcome posts a short notice ("Vote saved!" or "Error saving vote") that
disappears after `notice_ttl_ms` (2 seconds by default).

Two clicks make two votes: there is no deduplication of submissions.

## Leaderboards

Candidates of one category are sorted by decreasing count. Equal counts keep
the order of the candidate list. Candidates without votes and withdrawn
candidates are not shown. The first three places carry a marker:

| place | marker |
|-------|--------|
| 1     | 👑     |
| 2     | 🥈     |
| 3     | 🥉     |

## Settings

All the fields of [`crate::EngineSettings`] have defaults:

```json
{
  "snapshot_retry": {"min_delay_ms": 200, "max_delay_ms": 10000, "factor": 2.0, "max_attempts": 5, "jitter": false},
  "reconnect_retry": {"min_delay_ms": 200, "max_delay_ms": 10000, "factor": 2.0, "max_attempts": 5, "jitter": false},
  "notice_ttl_ms": 2000,
  "change_capacity": 256,
  "input_capacity": 1024
}
```

*/
