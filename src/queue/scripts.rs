//! Lua sources for the queue's atomic operations.
//!
//! Every multi-step mutation runs server-side so concurrent producers and
//! consumers only ever observe whole transitions. Scripts receive the queue
//! base name and build shard keys themselves; all per-queue keys share the
//! base-name prefix so a hash-tagged queue name keeps them in one cluster
//! slot.

/// Shuffle-shard write.
///
/// Grows the active stream count when the producer asks for more shards, and
/// shrinks only when every shard being retired is empty, so in-flight
/// messages stay readable across a resize. Among the caller's M candidate
/// shards the shortest wins (an empty one short-circuits), the entry is
/// appended, a MAXLEN-1 notification wakes one blocked consumer, and when
/// tracking is on the cancelation hash, its expiry sibling field, and the
/// deadline index are updated. TTLs on the stream, meta, and notification
/// keys are renewed last.
///
/// ARGV: base, total_streams, ttl_secs, width, <width shard ids>, n_fields,
/// <2*n_fields field/value>, track_flag, [track_value, deadline_secs,
/// track_ttl_secs, cancelation_key, deadlines_key]
///
/// Returns `{chosen_shard, entry_id}`.
pub const WRITE: &str = r#"
redis.replicate_commands()

local base = ARGV[1]
local total = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local width = tonumber(ARGV[4])

local meta = base .. ':meta'
local notifications = base .. ':notifications'

local active = tonumber(redis.call('HGET', meta, 'streams') or '1')
if total > active then
    redis.call('HSET', meta, 'streams', total)
    active = total
elseif total < active then
    local draining = false
    for i = total, active - 1 do
        if redis.call('XLEN', base .. ':s' .. i) > 0 then
            draining = true
            break
        end
    end
    if not draining then
        redis.call('HSET', meta, 'streams', total)
        active = total
    end
end

local chosen = nil
local shortest = nil
for i = 0, width - 1 do
    local idx = tonumber(ARGV[5 + i])
    if idx == nil or idx < 0 or idx >= total then
        return redis.error_reply('shard id out of range')
    end
    local len = redis.call('XLEN', base .. ':s' .. idx)
    if len == 0 then
        chosen = idx
        break
    end
    if shortest == nil or len < shortest then
        shortest = len
        chosen = idx
    end
end

local stream = base .. ':s' .. chosen
local n_fields = tonumber(ARGV[5 + width])
local fields = {}
for i = 0, n_fields * 2 - 1 do
    fields[i + 1] = ARGV[6 + width + i]
end
local id = redis.call('XADD', stream, '*', unpack(fields))
redis.call('XADD', notifications, 'MAXLEN', '1', '*', 'shard', chosen)

local track_at = 6 + width + n_fields * 2
if ARGV[track_at] == '1' then
    local track_value = ARGV[track_at + 1]
    local deadline = tonumber(ARGV[track_at + 2])
    local track_ttl = tonumber(ARGV[track_at + 3])
    local cancelation = ARGV[track_at + 4]
    local deadlines = ARGV[track_at + 5]
    if deadline == 0 then
        local t = redis.call('TIME')
        deadline = tonumber(t[1]) + track_ttl
    end
    local entry = cjson.encode({
        stream_id = stream,
        msg_id = id,
        track_value = track_value,
        deadline = deadline,
    })
    redis.call('HSET', cancelation, track_value, entry)
    redis.call('HSET', cancelation, track_value .. ':expiry:' .. deadline, deadline)
    redis.call('ZADD', deadlines, deadline, track_value)
end

redis.call('EXPIRE', stream, ttl)
redis.call('EXPIRE', meta, ttl)
redis.call('EXPIRE', notifications, ttl)

return {chosen, id}
"#;

/// Round-robin read.
///
/// Walks the shards once starting at the meta cursor, delivering at most one
/// entry via the consumer group and advancing the cursor past the shard that
/// produced it. Missing groups are created at "0" and the read retried once.
/// Whenever the walk touches shard 0 the legacy unsuffixed stream is probed
/// first to drain queues written before sharding; the group created there
/// gets the queue TTL so migration probing never leaves an immortal key.
///
/// ARGV: base, group, consumer, ttl_secs
///
/// Returns the raw XREADGROUP reply, or nil when every shard is empty.
pub const READ: &str = r#"
local base = ARGV[1]
local group = ARGV[2]
local consumer = ARGV[3]
local ttl = tonumber(ARGV[4])

local meta = base .. ':meta'
local streams = tonumber(redis.call('HGET', meta, 'streams') or '1')
local offset = tonumber(redis.call('HGET', meta, 'offset') or '0')
if offset >= streams then
    offset = 0
end

local function read_from(stream, make)
    local ok, res = pcall(redis.call, 'XREADGROUP', 'GROUP', group, consumer,
        'COUNT', '1', 'STREAMS', stream, '>')
    if ok then
        return res
    end
    local msg = res
    if type(res) == 'table' and res.err then
        msg = res.err
    end
    if not string.find(tostring(msg), 'NOGROUP') then
        error(res)
    end
    redis.call('XGROUP', 'CREATE', stream, group, '0', 'MKSTREAM')
    if make == 'legacy' then
        redis.call('EXPIRE', stream, ttl)
    end
    return redis.call('XREADGROUP', 'GROUP', group, consumer,
        'COUNT', '1', 'STREAMS', stream, '>')
end

for i = 0, streams - 1 do
    local idx = (offset + i) % streams
    if idx == 0 then
        local res = read_from(base, 'legacy')
        if res and res ~= false then
            redis.call('HSET', meta, 'offset', (idx + 1) % streams)
            return res
        end
    end
    local res = read_from(base .. ':s' .. idx, 'shard')
    if res and res ~= false then
        redis.call('HSET', meta, 'offset', (idx + 1) % streams)
        return res
    end
end

return false
"#;

/// Net queue length: total entries across active shards minus every group's
/// pending entries, nil when nothing is available.
///
/// ARGV: base
pub const LEN: &str = r#"
local base = ARGV[1]
local meta = base .. ':meta'
local streams = tonumber(redis.call('HGET', meta, 'streams') or '1')

local total = 0
local pending = 0
for i = 0, streams - 1 do
    local stream = base .. ':s' .. i
    total = total + redis.call('XLEN', stream)
    local ok, groups = pcall(redis.call, 'XINFO', 'GROUPS', stream)
    if ok then
        for _, g in ipairs(groups) do
            for j = 1, #g, 2 do
                if g[j] == 'pending' then
                    pending = pending + g[j + 1]
                end
            end
        end
    end
end

local net = total - pending
if net <= 0 then
    return false
end
return net
"#;

/// Queue statistics for one consumer group: total length and the group's
/// pending count, reported separately.
///
/// ARGV: base, group
pub const STATS: &str = r#"
local base = ARGV[1]
local group = ARGV[2]
local meta = base .. ':meta'
local streams = tonumber(redis.call('HGET', meta, 'streams') or '1')

local total = 0
local pending = 0
for i = 0, streams - 1 do
    local stream = base .. ':s' .. i
    total = total + redis.call('XLEN', stream)
    local ok, summary = pcall(redis.call, 'XPENDING', stream, group)
    if ok and summary then
        pending = pending + (tonumber(summary[1]) or 0)
    end
end

return {total, pending}
"#;
